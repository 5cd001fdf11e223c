//! Task commands
//!
//! Runs pipelines in-process, streaming script output as it arrives.

use anyhow::{Context, Result, bail};
use colored::*;
use relay_core::domain::output::{OutputLine, OutputStream};
use relay_core::domain::task::{Command, Task, TaskStatus};
use relay_core::dto::task::CreateTaskRequest;
use relay_engine::{EngineConfig, TaskRegistry, output_channel};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// Handle `relay run`
pub async fn handle_run(
    config: &EngineConfig,
    file: &Path,
    name: Option<String>,
    json: bool,
) -> Result<()> {
    let mut request = load_request(file)?;
    if let Some(name) = name {
        request.name = name;
    }

    let registry = Arc::new(TaskRegistry::from_config(config).context("Failed to load routes")?);
    let task = registry.create_from_request(request).await;
    run_task(registry, task, config.output_buffer, json).await
}

/// Handle `relay exec`
pub async fn handle_exec(
    config: &EngineConfig,
    route: String,
    args: Vec<String>,
    json: bool,
) -> Result<()> {
    let registry = Arc::new(TaskRegistry::from_config(config).context("Failed to load routes")?);
    let task = registry
        .create_task(route.clone(), vec![Command::new(route, args)], "")
        .await;
    run_task(registry, task, config.output_buffer, json).await
}

/// Reads a task request from a JSON file
fn load_request(file: &Path) -> Result<CreateTaskRequest> {
    let content = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let request: CreateTaskRequest = serde_json::from_str(&content)
        .with_context(|| format!("Invalid task request in {}", file.display()))?;

    if request.commands.is_empty() {
        warn!("Task '{}' has no commands", request.name);
    }
    Ok(request)
}

/// Starts the task and forwards its output until it finishes
///
/// Ctrl-C asks the registry to stop the task; the output keeps draining
/// while the stop is in flight so the runner never blocks on a full sink.
async fn run_task(
    registry: Arc<TaskRegistry>,
    task: Task,
    output_buffer: usize,
    json: bool,
) -> Result<()> {
    let id = task.id;
    let (sink, mut rx) = output_channel(output_buffer);

    if !json {
        println!(
            "{} {} ({})",
            "Running".bold(),
            task.name.cyan(),
            id.to_string().dimmed()
        );
    }

    let mut runner = {
        let registry = registry.clone();
        tokio::spawn(async move { registry.start_task(id, Some(sink)).await })
    };

    let mut stopping = false;
    let outcome = loop {
        tokio::select! {
            Some(line) = rx.recv() => {
                if !json {
                    print_output_line(&line);
                }
            }
            joined = &mut runner => break joined.context("Task runner panicked")?,
            _ = tokio::signal::ctrl_c(), if !stopping => {
                stopping = true;
                info!("Stopping task {}", id);
                let registry = registry.clone();
                tokio::spawn(async move {
                    if let Err(e) = registry.stop_task(id).await {
                        warn!("Failed to stop task {}: {}", id, e);
                    }
                });
            }
        }
    };

    while let Ok(line) = rx.try_recv() {
        if !json {
            print_output_line(&line);
        }
    }

    let task = registry.get_task_status(id).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&task)?);
    } else {
        println!();
        print_task_details(&task);
    }

    if let Err(e) = outcome {
        bail!("Task {} failed: {}", id, e);
    }
    Ok(())
}

/// Print one streamed line, prefixed with the command it came from
fn print_output_line(line: &OutputLine) {
    let prefix = format!("[{} {}]", line.command_index, line.command).dimmed();
    match line.stream {
        OutputStream::Stdout => println!("{} {}", prefix, line.line),
        OutputStream::Stderr => println!("{} {}", prefix, line.line.yellow()),
    }
}

/// Print detailed task information
fn print_task_details(task: &Task) {
    println!("{}", "Task Details:".bold());
    println!("  ID:        {}", task.id.to_string().cyan());
    println!("  Name:      {}", task.name);
    println!("  Status:    {}", colorize_status(&task.status));
    println!("  Work Dir:  {}", task.work_dir.display().to_string().dimmed());

    if let Some(started) = task.start_time {
        println!("  Started:   {}", started.format("%Y-%m-%d %H:%M:%S"));
    }
    if let Some(ended) = task.end_time {
        println!("  Ended:     {}", ended.format("%Y-%m-%d %H:%M:%S"));
    }
    if let Some(duration) = task.duration() {
        println!("  Duration:  {}s", duration.num_seconds());
    }
    if let Some(exit_code) = task.exit_code {
        println!("  Exit Code: {}", exit_code);
    }

    println!("\n{}", "Commands:".bold());
    for (index, command) in task.commands.iter().enumerate() {
        println!("  {} {}", format!("[{}]", index).dimmed(), command.invocation());
    }

    if !task.error.is_empty() {
        println!("\n{}", "Error:".bold());
        println!("{}", task.error.red());
    }
}

/// Colorize task status for display
fn colorize_status(status: &TaskStatus) -> colored::ColoredString {
    let status_str = status.to_string();
    match status {
        TaskStatus::Pending => status_str.yellow(),
        TaskStatus::Running => status_str.cyan(),
        TaskStatus::Completed => status_str.green(),
        TaskStatus::Failed => status_str.red(),
    }
}
