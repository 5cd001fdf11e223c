//! Commands module
//!
//! Defines all CLI commands and their handlers.

mod routes;
mod task;

use anyhow::Result;
use clap::Subcommand;
use relay_engine::EngineConfig;
use std::path::PathBuf;

/// Top-level CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Run a pipeline described by a JSON task request
    Run {
        /// File containing {"name", "commands", "work_dir"?}
        file: PathBuf,

        /// Override the task name from the file
        #[arg(long)]
        name: Option<String>,

        /// Print the finished task as JSON instead of a summary
        #[arg(long)]
        json: bool,
    },
    /// Run a single route as a one-command pipeline
    Exec {
        /// Route name
        route: String,

        /// Positional arguments substituted into the script
        args: Vec<String>,

        /// Print the finished task as JSON instead of a summary
        #[arg(long)]
        json: bool,
    },
    /// List configured routes
    Routes,
}

/// Handle a CLI command
///
/// Routes the command to the appropriate handler module.
pub async fn handle_command(command: Commands, config: &EngineConfig) -> Result<()> {
    match command {
        Commands::Run { file, name, json } => task::handle_run(config, &file, name, json).await,
        Commands::Exec { route, args, json } => {
            task::handle_exec(config, route, args, json).await
        }
        Commands::Routes => routes::handle_routes(config),
    }
}
