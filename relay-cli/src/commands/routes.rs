//! Route listing

use anyhow::{Context, Result};
use colored::*;
use relay_engine::{EngineConfig, Interpreter, RouteTable};
use std::path::Path;

/// List routes with the interpreter each script would run under
pub fn handle_routes(config: &EngineConfig) -> Result<()> {
    let routes = RouteTable::from_file(&config.routes_file, config.scripts_dir.clone())
        .context("Failed to load routes")?;

    if routes.is_empty() {
        println!(
            "{}",
            format!("No routes in {}.", config.routes_file.display()).yellow()
        );
        return Ok(());
    }

    println!(
        "{}",
        format!(
            "Found {} route(s) in {}:",
            routes.len(),
            config.routes_file.display()
        )
        .bold()
    );
    println!();

    for (name, script) in routes.iter() {
        let interpreter = match Interpreter::from_path(Path::new(script)) {
            Ok(interpreter) => interpreter.to_string().green(),
            Err(_) => "unsupported".red(),
        };
        println!("  {} {:<20} {} ({})", "▸".cyan(), name, script.dimmed(), interpreter);
    }

    Ok(())
}
