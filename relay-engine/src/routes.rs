//! Route table
//!
//! Maps logical command names to script files. Loaded once, read-only
//! afterwards; share it behind an `Arc`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::{Result, TaskError};

/// Immutable mapping of route name to script file
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    routes: BTreeMap<String, String>,
    scripts_dir: PathBuf,
}

impl RouteTable {
    /// Creates a route table from an in-memory mapping
    ///
    /// # Arguments
    /// * `routes` - Route name to script filename
    /// * `scripts_dir` - Directory relative script filenames are resolved against
    pub fn new(routes: impl IntoIterator<Item = (String, String)>, scripts_dir: PathBuf) -> Self {
        Self {
            routes: routes.into_iter().collect(),
            scripts_dir,
        }
    }

    /// Loads a route table from a JSON object file
    ///
    /// The file must contain a flat `{"route": "script.sh"}` object.
    pub fn from_file(path: &Path, scripts_dir: PathBuf) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| TaskError::InvalidRoutes {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

        let routes: BTreeMap<String, String> =
            serde_json::from_str(&contents).map_err(|e| TaskError::InvalidRoutes {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;

        info!("Loaded {} route(s) from {}", routes.len(), path.display());

        Ok(Self {
            routes,
            scripts_dir,
        })
    }

    /// Resolves a route name to the script path
    ///
    /// A missing route is a runtime error, never a load-time one.
    pub fn resolve(&self, name: &str) -> Result<PathBuf> {
        let script = self
            .routes
            .get(name)
            .ok_or_else(|| TaskError::RouteNotFound(name.to_string()))?;

        let path = Path::new(script);
        let resolved = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.scripts_dir.join(path)
        };

        debug!("Resolved route '{}' to {}", name, resolved.display());
        Ok(resolved)
    }

    /// Iterates routes in name order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.routes.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn scripts_dir(&self) -> &Path {
        &self.scripts_dir
    }
}
