//! Task registry
//!
//! Owns every task and is the only place task status and output change.
//! The task table sits behind one async `RwLock`: reads share it, state
//! transitions take it exclusively, and pipeline execution runs with the
//! lock released so other tasks stay visible and startable.

use chrono::Utc;
use relay_core::domain::task::{Command, Task, TaskStatus};
use relay_core::dto::task::{CreateTaskRequest, TaskSummary};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::{Result, TaskError};
use crate::pipeline::{PipelineExecutor, PipelineOutcome};
use crate::routes::RouteTable;
use crate::runner::{OutputSink, ProcessRunner};
use crate::stop::{StopHandle, stop_channel};

/// Error recorded on tasks stopped through `stop_task`
pub const STOPPED_BY_USER: &str = "stopped by user";

/// Registry of tasks and their lifecycle
///
/// Construct one and share it (usually behind an `Arc`) with every caller.
pub struct TaskRegistry {
    tasks: RwLock<TaskTable>,
    executor: PipelineExecutor,
    base_work_dir: PathBuf,
}

#[derive(Default)]
struct TaskTable {
    /// Insertion order, for deterministic listing
    order: Vec<Uuid>,
    entries: HashMap<Uuid, TaskEntry>,
}

struct TaskEntry {
    task: Task,
    /// Present exactly while the task is `Running`
    stop: Option<StopHandle>,
}

impl TaskTable {
    fn get(&self, id: Uuid) -> Result<&TaskEntry> {
        self.entries.get(&id).ok_or(TaskError::TaskNotFound(id))
    }

    fn get_mut(&mut self, id: Uuid) -> Result<&mut TaskEntry> {
        self.entries.get_mut(&id).ok_or(TaskError::TaskNotFound(id))
    }

    fn iter(&self) -> impl Iterator<Item = &Task> {
        self.order
            .iter()
            .filter_map(|id| self.entries.get(id).map(|entry| &entry.task))
    }

    fn remove(&mut self, id: Uuid) -> Option<Task> {
        let entry = self.entries.remove(&id)?;
        self.order.retain(|existing| *existing != id);
        Some(entry.task)
    }
}

impl TaskRegistry {
    /// Creates a new registry
    ///
    /// # Arguments
    /// * `executor` - Pipeline executor shared by all tasks
    /// * `base_work_dir` - Work dir for tasks created without one
    pub fn new(executor: PipelineExecutor, base_work_dir: PathBuf) -> Self {
        Self {
            tasks: RwLock::new(TaskTable::default()),
            executor,
            base_work_dir,
        }
    }

    /// Builds a registry from configuration, loading the route table
    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        let routes = RouteTable::from_file(&config.routes_file, config.scripts_dir.clone())?;
        let executor = PipelineExecutor::new(
            Arc::new(routes),
            ProcessRunner::new(config.stderr_mode),
        );
        Ok(Self::new(executor, config.base_work_dir.clone()))
    }

    pub fn routes(&self) -> &RouteTable {
        self.executor.routes()
    }

    /// Creates a pending task
    ///
    /// An empty `work_dir` falls back to the base work dir.
    pub async fn create_task(
        &self,
        name: impl Into<String>,
        commands: Vec<Command>,
        work_dir: impl Into<PathBuf>,
    ) -> Task {
        let mut work_dir = work_dir.into();
        if work_dir.as_os_str().is_empty() {
            work_dir = self.base_work_dir.clone();
        }

        let task = Task::new(name.into(), commands, work_dir);

        let mut tasks = self.tasks.write().await;
        tasks.order.push(task.id);
        tasks.entries.insert(
            task.id,
            TaskEntry {
                task: task.clone(),
                stop: None,
            },
        );

        info!(
            "Task created: {} ('{}', {} command(s))",
            task.id,
            task.name,
            task.commands.len()
        );
        task
    }

    /// Creates a pending task from a request DTO
    pub async fn create_from_request(&self, request: CreateTaskRequest) -> Task {
        self.create_task(
            request.name,
            request.commands,
            request.work_dir.unwrap_or_default(),
        )
        .await
    }

    /// Runs a pending task's pipeline to the end
    ///
    /// Resolves once the pipeline completes, fails, or is stopped. Run it on
    /// its own tokio task to execute several tasks at once.
    ///
    /// # Returns
    /// Snapshot of the completed task
    ///
    /// # Errors
    /// * `TaskNotFound`, `TaskAlreadyRunning`, `TaskFinished` - nothing ran
    /// * `CommandFailed` - the pipeline failed; the task is `Failed` with
    ///   the partial transcript
    pub async fn start_task(&self, id: Uuid, sink: Option<OutputSink>) -> Result<Task> {
        let (task_id, commands, work_dir, mut listener) = {
            let mut tasks = self.tasks.write().await;
            let entry = tasks.get_mut(id)?;

            match entry.task.status {
                TaskStatus::Pending => {}
                TaskStatus::Running => return Err(TaskError::TaskAlreadyRunning(id)),
                status => return Err(TaskError::TaskFinished { id, status }),
            }

            let (handle, listener) = stop_channel();
            entry.task.status = TaskStatus::Running;
            entry.task.start_time = Some(Utc::now());
            entry.stop = Some(handle);

            (
                entry.task.id,
                entry.task.commands.clone(),
                entry.task.work_dir.clone(),
                listener,
            )
        };

        info!("Task {} started", task_id);

        let outcome = self
            .executor
            .execute(task_id, &commands, &work_dir, sink.as_ref(), &mut listener)
            .await;

        let result = self.record_outcome(id, outcome).await;

        // The stop requester reads the state recorded above
        listener.confirm();
        result
    }

    /// Moves a running task into its terminal state
    ///
    /// The only place a task leaves `Running`.
    async fn record_outcome(&self, id: Uuid, outcome: PipelineOutcome) -> Result<Task> {
        let mut tasks = self.tasks.write().await;

        // Running tasks cannot be removed, but never mask the pipeline's own error
        let Some(entry) = tasks.entries.get_mut(&id) else {
            return match outcome.result {
                Err(e) => Err(e),
                Ok(()) => Err(TaskError::TaskNotFound(id)),
            };
        };

        entry.stop = None;
        entry.task.output = outcome.transcript;
        entry.task.end_time = Some(Utc::now());

        match outcome.result {
            Ok(()) => {
                entry.task.status = TaskStatus::Completed;
                entry.task.exit_code = Some(0);
                info!("Task {} completed", id);
                Ok(entry.task.clone())
            }
            Err(e) => {
                entry.task.status = TaskStatus::Failed;
                entry.task.exit_code = Some(e.exit_code());
                if e.is_stopped() {
                    entry.task.error = STOPPED_BY_USER.to_string();
                    info!("Task {} stopped", id);
                } else {
                    entry.task.error = e.to_string();
                    warn!("Task {} failed: {}", id, e);
                }
                Err(e)
            }
        }
    }

    /// Stops a running task
    ///
    /// Kills the live process group, if any, and waits until the task is
    /// recorded as `Failed` with error `"stopped by user"`. The returned
    /// snapshot carries the partial transcript.
    ///
    /// # Errors
    /// * `TaskNotFound` - unknown id
    /// * `TaskNotRunning` - not running, or finished before the stop landed
    /// * `StopFailed` - the process could not be killed; status unchanged
    pub async fn stop_task(&self, id: Uuid) -> Result<Task> {
        let handle = {
            let tasks = self.tasks.read().await;
            let entry = tasks.get(id)?;
            match (&entry.task.status, &entry.stop) {
                (TaskStatus::Running, Some(handle)) => handle.clone(),
                _ => return Err(TaskError::TaskNotRunning(id)),
            }
        };

        info!("Stopping task {}", id);

        let stopped = handle
            .request_stop()
            .await
            .map_err(TaskError::StopFailed)?;

        if !stopped {
            return Err(TaskError::TaskNotRunning(id));
        }

        // Confirmed only after start_task recorded the stop
        let tasks = self.tasks.read().await;
        let task = &tasks.get(id)?.task;
        if task.status == TaskStatus::Failed && task.error == STOPPED_BY_USER {
            Ok(task.clone())
        } else {
            Err(TaskError::TaskNotRunning(id))
        }
    }

    /// Snapshot of one task
    pub async fn get_task_status(&self, id: Uuid) -> Result<Task> {
        let tasks = self.tasks.read().await;
        Ok(tasks.get(id)?.task.clone())
    }

    /// Snapshots of all tasks in creation order
    pub async fn list_tasks(&self) -> Vec<Task> {
        let tasks = self.tasks.read().await;
        tasks.iter().cloned().collect()
    }

    /// Summaries of all tasks in creation order
    pub async fn list_summaries(&self) -> Vec<TaskSummary> {
        let tasks = self.tasks.read().await;
        tasks.iter().map(TaskSummary::from).collect()
    }

    /// Removes a task that is not running
    pub async fn remove_task(&self, id: Uuid) -> Result<Task> {
        let mut tasks = self.tasks.write().await;

        if tasks.get(id)?.task.status == TaskStatus::Running {
            return Err(TaskError::TaskAlreadyRunning(id));
        }

        let task = tasks.remove(id).ok_or(TaskError::TaskNotFound(id))?;
        info!("Task {} removed", id);
        Ok(task)
    }

    /// Removes finished tasks whose end time is older than `older_than`
    ///
    /// # Returns
    /// Number of tasks removed
    pub async fn prune_finished(&self, older_than: chrono::Duration) -> usize {
        let cutoff = Utc::now() - older_than;
        let mut tasks = self.tasks.write().await;

        let expired: Vec<Uuid> = tasks
            .iter()
            .filter(|task| task.status.is_terminal())
            .filter(|task| task.end_time.is_some_and(|end| end <= cutoff))
            .map(|task| task.id)
            .collect();

        for id in &expired {
            tasks.remove(*id);
        }

        if !expired.is_empty() {
            info!("Pruned {} finished task(s)", expired.len());
        }
        expired.len()
    }
}
