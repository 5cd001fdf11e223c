//! Output event types

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single line of process output, streamed while a task runs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputLine {
    pub task_id: Uuid,
    /// Position of the producing command in the pipeline (0-based)
    pub command_index: usize,
    /// Route name of the producing command
    pub command: String,
    pub stream: OutputStream,
    pub line: String,
}

/// Which process stream a line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputStream {
    Stdout,
    Stderr,
}
