//! Configuration module
//!
//! Global CLI options layered over the engine configuration.

use anyhow::{Context, Result};
use clap::Args;
use relay_engine::{EngineConfig, StderrMode};
use std::path::PathBuf;
use tracing::{debug, warn};

/// Engine options shared by every subcommand
#[derive(Args, Debug, Default)]
pub struct EngineArgs {
    /// JSON file mapping route names to scripts
    #[arg(long, global = true, env = "RELAY_ROUTES_FILE")]
    pub routes: Option<PathBuf>,

    /// Directory relative script names are resolved against
    #[arg(long, global = true, env = "RELAY_SCRIPTS_DIR")]
    pub scripts: Option<PathBuf>,

    /// Base directory sandboxes are created in
    #[arg(long, global = true, env = "RELAY_WORK_DIR")]
    pub work_dir: Option<PathBuf>,

    /// Script stderr handling: discard, merge or inherit
    #[arg(long, global = true, env = "RELAY_STDERR")]
    pub stderr: Option<StderrMode>,

    /// Output lines buffered between the script and the terminal
    #[arg(long, global = true, env = "RELAY_OUTPUT_BUFFER")]
    pub output_buffer: Option<usize>,
}

impl EngineArgs {
    /// Resolves the final engine configuration
    ///
    /// Environment first, falling back to defaults, then explicit flags.
    pub fn load(self) -> Result<EngineConfig> {
        let mut config = match EngineConfig::from_env() {
            Ok(config) => config,
            Err(e) => {
                warn!("Ignoring engine environment: {:#}", e);
                EngineConfig::default()
            }
        };

        if let Some(routes) = self.routes {
            config.routes_file = routes;
        }
        if let Some(scripts) = self.scripts {
            config.scripts_dir = scripts;
        }
        if let Some(work_dir) = self.work_dir {
            config.base_work_dir = work_dir;
        }
        if let Some(stderr) = self.stderr {
            config.stderr_mode = stderr;
        }
        if let Some(output_buffer) = self.output_buffer {
            config.output_buffer = output_buffer;
        }

        config.validate().context("Invalid configuration")?;
        debug!("Using configuration: {:?}", config);
        Ok(config)
    }
}
