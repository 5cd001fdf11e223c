//! Relay Engine
//!
//! Runs named, parameterized command pipelines as isolated OS processes.
//! It includes:
//! - Route table mapping command names to script files
//! - Per-pipeline sandbox directories with placeholder substitution
//! - Process runner with live line streaming and stop support
//! - Fail-fast pipeline executor
//! - Task registry owning the task lifecycle
//!
//! Pipelines are fail-fast without rollback: when command `k + 1` fails,
//! whatever command `k` did to the filesystem or elsewhere stays done.

pub mod config;
pub mod error;
pub mod pipeline;
pub mod registry;
pub mod routes;
pub mod runner;
pub mod sandbox;
pub mod stop;

pub use config::{EngineConfig, StderrMode};
pub use error::{Result, TaskError};
pub use pipeline::{PipelineExecutor, PipelineOutcome};
pub use registry::TaskRegistry;
pub use routes::RouteTable;
pub use runner::{Interpreter, OutputSink, ProcessRunner, output_channel};
pub use sandbox::Sandbox;
pub use stop::{StopHandle, StopListener, stop_channel};

pub use relay_core::domain::output::{OutputLine, OutputStream};
pub use relay_core::domain::task::{Command, Task, TaskStatus};
pub use relay_core::dto::task::{CreateTaskRequest, TaskSummary};
