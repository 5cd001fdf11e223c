//! Engine configuration
//!
//! Defines where routes and scripts live, where sandboxes are created,
//! and how process output is captured.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;

/// Engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// JSON file mapping route names to script filenames
    pub routes_file: PathBuf,

    /// Directory relative script filenames are resolved against
    pub scripts_dir: PathBuf,

    /// Base working directory for tasks created without one
    pub base_work_dir: PathBuf,

    /// Capacity of output channels handed out by `output_channel`
    pub output_buffer: usize,

    /// What to do with the standard error of scripts
    pub stderr_mode: StderrMode,
}

impl EngineConfig {
    /// Creates a new configuration with defaults
    pub fn new(routes_file: PathBuf, scripts_dir: PathBuf) -> Self {
        Self {
            routes_file,
            scripts_dir,
            base_work_dir: std::env::temp_dir(),
            output_buffer: 256,
            stderr_mode: StderrMode::Discard,
        }
    }

    /// Creates configuration from environment variables
    ///
    /// Expected environment variables:
    /// - RELAY_ROUTES_FILE (optional, default: routes.json)
    /// - RELAY_SCRIPTS_DIR (optional, default: scripts)
    /// - RELAY_WORK_DIR (optional, default: system temp dir)
    /// - RELAY_OUTPUT_BUFFER (optional, default: 256)
    /// - RELAY_STDERR (optional, discard|merge|inherit, default: discard)
    pub fn from_env() -> anyhow::Result<Self> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("RELAY_ROUTES_FILE") {
            config.routes_file = PathBuf::from(path);
        }

        if let Ok(path) = std::env::var("RELAY_SCRIPTS_DIR") {
            config.scripts_dir = PathBuf::from(path);
        }

        if let Ok(path) = std::env::var("RELAY_WORK_DIR") {
            config.base_work_dir = PathBuf::from(path);
        }

        if let Ok(value) = std::env::var("RELAY_OUTPUT_BUFFER") {
            config.output_buffer = value
                .parse::<usize>()
                .map_err(|_| anyhow::anyhow!("RELAY_OUTPUT_BUFFER must be a number, got '{}'", value))?;
        }

        if let Ok(value) = std::env::var("RELAY_STDERR") {
            config.stderr_mode = value.parse()?;
        }

        Ok(config)
    }

    /// Validates the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.routes_file.as_os_str().is_empty() {
            anyhow::bail!("routes_file cannot be empty");
        }

        if self.base_work_dir.as_os_str().is_empty() {
            anyhow::bail!("base_work_dir cannot be empty");
        }

        if self.output_buffer == 0 {
            anyhow::bail!("output_buffer must be greater than 0");
        }

        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new(PathBuf::from("routes.json"), PathBuf::from("scripts"))
    }
}

/// Standard error handling for script processes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StderrMode {
    /// Stderr goes to /dev/null
    #[default]
    Discard,

    /// Stderr lines are captured and streamed alongside stdout
    Merge,

    /// Stderr is passed through to the engine's own stderr
    Inherit,
}

impl FromStr for StderrMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "discard" => Ok(StderrMode::Discard),
            "merge" => Ok(StderrMode::Merge),
            "inherit" => Ok(StderrMode::Inherit),
            other => anyhow::bail!(
                "Unknown stderr mode '{}', expected discard, merge or inherit",
                other
            ),
        }
    }
}

impl std::fmt::Display for StderrMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StderrMode::Discard => write!(f, "discard"),
            StderrMode::Merge => write!(f, "merge"),
            StderrMode::Inherit => write!(f, "inherit"),
        }
    }
}
