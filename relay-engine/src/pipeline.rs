//! Command pipeline executor
//!
//! Runs a task's commands in order inside one shared sandbox:
//! - Resolving each command name through the route table
//! - Preparing the script copy with its arguments and the previous output
//! - Running it and collecting a labeled transcript block
//!
//! The first failure aborts the pipeline. Completed commands are not rolled
//! back.

use relay_core::domain::task::Command;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::error::{Result, TaskError};
use crate::routes::RouteTable;
use crate::runner::{OutputSink, ProcessRunner, RunTarget};
use crate::sandbox::Sandbox;
use crate::stop::StopListener;

/// Separator between command blocks in a transcript
pub const TRANSCRIPT_DELIMITER: &str = "----------------------------------------\n";

/// Transcript and result of one pipeline execution
#[derive(Debug)]
pub struct PipelineOutcome {
    /// Blocks of every command that ran, including a failed one
    pub transcript: String,
    pub result: Result<()>,
}

/// Executes command pipelines against a route table
#[derive(Debug, Clone)]
pub struct PipelineExecutor {
    routes: Arc<RouteTable>,
    runner: ProcessRunner,
}

impl PipelineExecutor {
    /// Creates a new pipeline executor
    ///
    /// # Arguments
    /// * `routes` - Shared, read-only route table
    /// * `runner` - Process runner used for every command
    pub fn new(routes: Arc<RouteTable>, runner: ProcessRunner) -> Self {
        Self { routes, runner }
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    /// Executes `commands` in order until one fails
    ///
    /// The sandbox is created inside `work_dir` and removed before this
    /// returns, whatever the outcome.
    pub async fn execute(
        &self,
        task_id: Uuid,
        commands: &[Command],
        work_dir: &Path,
        sink: Option<&OutputSink>,
        stop: &mut StopListener,
    ) -> PipelineOutcome {
        let sandbox = match Sandbox::create(work_dir) {
            Ok(sandbox) => sandbox,
            Err(e) => {
                error!("Task {}: {}", task_id, e);
                return PipelineOutcome {
                    transcript: String::new(),
                    result: Err(e),
                };
            }
        };

        info!(
            "Task {}: executing {} command(s) in {}",
            task_id,
            commands.len(),
            sandbox.path().display()
        );

        let mut transcript = String::new();
        let mut last_output = String::new();

        for (index, command) in commands.iter().enumerate() {
            info!(
                "Task {}: command {}/{}: {}",
                task_id,
                index + 1,
                commands.len(),
                command.name
            );

            if index > 0 {
                transcript.push_str(TRANSCRIPT_DELIMITER);
            }
            transcript.push_str(&format!("[{}] {}\n", index, command.invocation()));

            let target = RunTarget {
                task_id,
                command_index: index,
                command_name: &command.name,
            };

            let mut captured = String::new();
            let result = self
                .execute_command(&sandbox, command, target, &last_output, sink, stop, &mut captured)
                .await;
            transcript.push_str(&captured);

            if let Err(source) = result {
                error!("Task {}: command {} ({}) failed: {}", task_id, index, command.name, source);
                sandbox.close();
                return PipelineOutcome {
                    transcript,
                    result: Err(TaskError::CommandFailed {
                        index,
                        name: command.name.clone(),
                        source: Box::new(source),
                    }),
                };
            }

            debug!("Task {}: command {} completed", task_id, index);
            last_output = captured.trim_end_matches('\n').to_string();
        }

        sandbox.close();
        info!("Task {}: pipeline completed", task_id);

        PipelineOutcome {
            transcript,
            result: Ok(()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute_command(
        &self,
        sandbox: &Sandbox,
        command: &Command,
        target: RunTarget<'_>,
        last_output: &str,
        sink: Option<&OutputSink>,
        stop: &mut StopListener,
        captured: &mut String,
    ) -> Result<()> {
        if let Some(ack) = stop.pending() {
            stop.accept(ack);
            return Err(TaskError::Stopped);
        }

        let script = self.routes.resolve(&command.name)?;
        let prepared = sandbox.prepare(&script, &command.args, last_output).await?;

        self.runner
            .run(&prepared, sandbox.path(), target, sink, stop, captured)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::output_channel;
    use std::path::PathBuf;

    struct Fixture {
        scripts: tempfile::TempDir,
        work: tempfile::TempDir,
    }

    impl Fixture {
        fn new(scripts: &[(&str, &str)]) -> Self {
            let fixture = Self {
                scripts: tempfile::tempdir().unwrap(),
                work: tempfile::tempdir().unwrap(),
            };
            for (name, body) in scripts {
                std::fs::write(fixture.scripts.path().join(name), body).unwrap();
            }
            fixture
        }

        fn executor(&self, routes: &[(&str, &str)]) -> PipelineExecutor {
            let routes = RouteTable::new(
                routes
                    .iter()
                    .map(|(name, script)| (name.to_string(), script.to_string())),
                self.scripts.path().to_path_buf(),
            );
            PipelineExecutor::new(Arc::new(routes), ProcessRunner::default())
        }

        fn work_dir(&self) -> PathBuf {
            self.work.path().to_path_buf()
        }

        fn work_dir_is_empty(&self) -> bool {
            std::fs::read_dir(self.work.path()).unwrap().count() == 0
        }
    }

    fn command(name: &str, args: &[&str]) -> Command {
        Command::new(name, args.iter().map(|a| a.to_string()).collect())
    }

    #[tokio::test]
    async fn test_last_output_is_chained() {
        let fixture = Fixture::new(&[
            ("greet.sh", "echo hello *#ARG_1#*\n"),
            ("shout.sh", "echo \"*#LAST_OUTPUT#*\" | tr a-z A-Z\n"),
        ]);
        let executor = fixture.executor(&[("greet", "greet.sh"), ("shout", "shout.sh")]);

        let outcome = executor
            .execute(
                Uuid::new_v4(),
                &[command("greet", &["world"]), command("shout", &[])],
                &fixture.work_dir(),
                None,
                &mut StopListener::detached(),
            )
            .await;

        assert!(outcome.result.is_ok());
        assert_eq!(
            outcome.transcript,
            format!(
                "[0] greet world\nhello world\n{}[1] shout\nHELLO WORLD\n",
                TRANSCRIPT_DELIMITER
            )
        );
        assert!(fixture.work_dir_is_empty());
    }

    #[tokio::test]
    async fn test_fail_fast_keeps_failed_block_only() {
        let fixture = Fixture::new(&[
            ("one.sh", "echo first\n"),
            ("two.sh", "echo second\nexit 4\n"),
            ("three.sh", "echo third\n"),
        ]);
        let executor =
            fixture.executor(&[("one", "one.sh"), ("two", "two.sh"), ("three", "three.sh")]);

        let outcome = executor
            .execute(
                Uuid::new_v4(),
                &[command("one", &[]), command("two", &[]), command("three", &[])],
                &fixture.work_dir(),
                None,
                &mut StopListener::detached(),
            )
            .await;

        let err = outcome.result.unwrap_err();
        assert_eq!(err.command_index(), Some(1));
        assert_eq!(err.exit_code(), 4);
        assert!(outcome.transcript.contains("first"));
        assert!(outcome.transcript.contains("[1] two\nsecond\n"));
        assert!(!outcome.transcript.contains("third"));
        assert!(!outcome.transcript.contains("[2]"));
        assert!(fixture.work_dir_is_empty());
    }

    #[tokio::test]
    async fn test_unknown_route_spawns_nothing() {
        let fixture = Fixture::new(&[("one.sh", "echo ran\n")]);
        let executor = fixture.executor(&[("one", "one.sh")]);
        let (sink, mut rx) = output_channel(8);

        let outcome = executor
            .execute(
                Uuid::new_v4(),
                &[command("missing", &[]), command("one", &[])],
                &fixture.work_dir(),
                Some(&sink),
                &mut StopListener::detached(),
            )
            .await;

        match outcome.result {
            Err(TaskError::CommandFailed { index, source, .. }) => {
                assert_eq!(index, 0);
                assert!(matches!(*source, TaskError::RouteNotFound(ref name) if name == "missing"));
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(outcome.transcript, "[0] missing\n");
        assert!(rx.try_recv().is_err());
        assert!(fixture.work_dir_is_empty());
    }

    #[tokio::test]
    async fn test_side_effects_of_completed_commands_persist() {
        let fixture = Fixture::new(&[
            ("write.sh", "echo done > *#ARG_1#*\n"),
            ("fail.sh", "exit 1\n"),
        ]);
        let executor = fixture.executor(&[("write", "write.sh"), ("fail", "fail.sh")]);
        let marker = tempfile::tempdir().unwrap();
        let marker_file = marker.path().join("marker");

        let outcome = executor
            .execute(
                Uuid::new_v4(),
                &[
                    command("write", &[marker_file.to_str().unwrap()]),
                    command("fail", &[]),
                ],
                &fixture.work_dir(),
                None,
                &mut StopListener::detached(),
            )
            .await;

        assert!(outcome.result.is_err());
        assert_eq!(std::fs::read_to_string(&marker_file).unwrap(), "done\n");
    }

    #[tokio::test]
    async fn test_empty_pipeline_succeeds() {
        let fixture = Fixture::new(&[]);
        let executor = fixture.executor(&[]);

        let outcome = executor
            .execute(
                Uuid::new_v4(),
                &[],
                &fixture.work_dir(),
                None,
                &mut StopListener::detached(),
            )
            .await;

        assert!(outcome.result.is_ok());
        assert!(outcome.transcript.is_empty());
        assert!(fixture.work_dir_is_empty());
    }
}
