//! Task DTOs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

use crate::domain::task::{Command, Task, TaskStatus};

/// Request to create a new task
///
/// An absent or empty `work_dir` means "use the configured base directory".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTaskRequest {
    pub name: String,
    pub commands: Vec<Command>,
    #[serde(default)]
    pub work_dir: Option<PathBuf>,
}

/// Task summary for listing, without the transcript
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSummary {
    /// Unique identifier for the task
    pub id: Uuid,

    /// Caller supplied label
    pub name: String,

    /// Number of commands in the pipeline
    pub command_count: usize,

    /// Current status
    pub status: TaskStatus,

    /// When the task was created
    pub created_at: DateTime<Utc>,

    /// When the task left `Running`, if it did
    pub end_time: Option<DateTime<Utc>>,

    pub exit_code: Option<i32>,
}

impl From<&Task> for TaskSummary {
    fn from(task: &Task) -> Self {
        TaskSummary {
            id: task.id,
            name: task.name.clone(),
            command_count: task.commands.len(),
            status: task.status,
            created_at: task.created_at,
            end_time: task.end_time,
            exit_code: task.exit_code,
        }
    }
}
