//! Error types for the task engine

use relay_core::domain::task::TaskStatus;
use std::path::PathBuf;
use thiserror::Error;
use uuid::Uuid;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, TaskError>;

/// Errors that can occur while managing or executing tasks
#[derive(Debug, Error)]
pub enum TaskError {
    /// No task with this id exists in the registry
    #[error("Task not found: {0}")]
    TaskNotFound(Uuid),

    /// The task is already executing its pipeline
    #[error("Task {0} is already running")]
    TaskAlreadyRunning(Uuid),

    /// Stop was requested for a task that is not executing
    #[error("Task {0} is not running")]
    TaskNotRunning(Uuid),

    /// Terminal tasks cannot be restarted
    #[error("Task {id} already finished with status {status}")]
    TaskFinished { id: Uuid, status: TaskStatus },

    /// Command name has no entry in the route table
    #[error("Route not found: {0}")]
    RouteNotFound(String),

    /// Route configuration could not be loaded
    #[error("Invalid route configuration {}: {message}", .path.display())]
    InvalidRoutes { path: PathBuf, message: String },

    /// Script extension has no interpreter
    #[error("Unsupported script type: {}", .0.display())]
    UnsupportedScriptType(PathBuf),

    #[error("Failed to create sandbox in {}: {source}", .path.display())]
    SandboxCreate {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to read script {}: {source}", .path.display())]
    ScriptRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to write script {}: {source}", .path.display())]
    ScriptWrite {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The interpreter process could not be spawned
    #[error("Failed to start {program}: {source}")]
    ProcessStart {
        program: String,
        source: std::io::Error,
    },

    /// Reading process output or waiting for exit failed
    #[error("Process I/O error: {0}")]
    ProcessIo(#[source] std::io::Error),

    /// The process exited unsuccessfully
    #[error("Process exited with code {exit_code}")]
    ProcessFailed { exit_code: i32 },

    /// A pipeline step failed; `index` is 0-based
    #[error("Command {index} ({name}) failed: {source}")]
    CommandFailed {
        index: usize,
        name: String,
        source: Box<TaskError>,
    },

    /// Killing the running process failed
    #[error("Failed to stop process: {0}")]
    StopFailed(#[source] std::io::Error),

    /// Execution was interrupted by a stop request
    #[error("Stopped by user")]
    Stopped,
}

impl TaskError {
    /// Exit code recorded on a task that failed with this error
    ///
    /// Non-zero process exits keep their code, killed processes report -1,
    /// everything else reports 1.
    pub fn exit_code(&self) -> i32 {
        match self {
            TaskError::ProcessFailed { exit_code } => *exit_code,
            TaskError::CommandFailed { source, .. } => source.exit_code(),
            TaskError::Stopped | TaskError::StopFailed(_) => -1,
            _ => 1,
        }
    }

    /// Whether this error (or the step error it wraps) is a stop
    pub fn is_stopped(&self) -> bool {
        match self {
            TaskError::Stopped => true,
            TaskError::CommandFailed { source, .. } => source.is_stopped(),
            _ => false,
        }
    }

    /// Index of the failed pipeline step, if the error came from one
    pub fn command_index(&self) -> Option<usize> {
        match self {
            TaskError::CommandFailed { index, .. } => Some(*index),
            _ => None,
        }
    }
}
