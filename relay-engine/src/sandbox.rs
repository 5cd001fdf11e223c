//! Script sandbox
//!
//! Each pipeline execution gets one fresh directory inside the task's work
//! dir. Scripts are copied into it with placeholders substituted, and the
//! directory is removed when the sandbox is closed or dropped.
//!
//! Placeholders:
//! - `*#ARG_<n>#*` is replaced with the n-th (1-indexed) command argument
//! - `*#LAST_OUTPUT#*` is replaced with the previous command's output
//!
//! Unknown tokens and out-of-range argument indices are left untouched.

use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, warn};

use crate::error::{Result, TaskError};

const PLACEHOLDER_OPEN: &str = "*#";
const PLACEHOLDER_CLOSE: &str = "#*";
const LAST_OUTPUT: &str = "LAST_OUTPUT";
const ARG_PREFIX: &str = "ARG_";

/// Ephemeral directory owned by a single pipeline execution
#[derive(Debug)]
pub struct Sandbox {
    dir: TempDir,
}

impl Sandbox {
    /// Creates a uniquely named sandbox inside `work_dir`
    ///
    /// `work_dir` is created first if it does not exist.
    pub fn create(work_dir: &Path) -> Result<Self> {
        let sandbox_error = |source| TaskError::SandboxCreate {
            path: work_dir.to_path_buf(),
            source,
        };

        std::fs::create_dir_all(work_dir).map_err(sandbox_error)?;

        let dir = tempfile::Builder::new()
            .prefix("relay-")
            .tempdir_in(work_dir)
            .map_err(sandbox_error)?;

        debug!("Created sandbox {}", dir.path().display());
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Copies `script` into the sandbox with placeholders substituted
    ///
    /// The copy keeps the script's base filename and is made executable.
    ///
    /// # Returns
    /// Path of the prepared copy
    pub async fn prepare(&self, script: &Path, args: &[String], last_output: &str) -> Result<PathBuf> {
        let template = tokio::fs::read_to_string(script)
            .await
            .map_err(|source| TaskError::ScriptRead {
                path: script.to_path_buf(),
                source,
            })?;

        let file_name = script.file_name().ok_or_else(|| TaskError::ScriptRead {
            path: script.to_path_buf(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "script path has no file name"),
        })?;
        let target = self.path().join(file_name);

        let contents = substitute(&template, args, last_output);

        let write_error = |source| TaskError::ScriptWrite {
            path: target.clone(),
            source,
        };

        tokio::fs::write(&target, contents)
            .await
            .map_err(write_error)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&target, std::fs::Permissions::from_mode(0o755))
                .await
                .map_err(write_error)?;
        }

        debug!("Prepared {} from {}", target.display(), script.display());
        Ok(target)
    }

    /// Removes the sandbox directory, logging instead of failing
    pub fn close(self) {
        let path = self.dir.path().to_path_buf();
        match self.dir.close() {
            Ok(()) => debug!("Removed sandbox {}", path.display()),
            Err(e) => warn!("Failed to remove sandbox {}: {}", path.display(), e),
        }
    }
}

/// Replaces argument and last-output placeholders in one pass
///
/// Substituted values are never rescanned, so an argument that itself
/// contains a placeholder is inserted literally.
pub fn substitute(template: &str, args: &[String], last_output: &str) -> String {
    let mut result = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find(PLACEHOLDER_OPEN) {
        result.push_str(&rest[..start]);
        let after_open = &rest[start + PLACEHOLDER_OPEN.len()..];

        let Some(end) = after_open.find(PLACEHOLDER_CLOSE) else {
            result.push_str(&rest[start..]);
            return result;
        };

        match placeholder_value(&after_open[..end], args, last_output) {
            Some(value) => {
                result.push_str(value);
                rest = &after_open[end + PLACEHOLDER_CLOSE.len()..];
            }
            None => {
                // Not ours; keep the opener and rescan right after it
                result.push_str(PLACEHOLDER_OPEN);
                rest = after_open;
            }
        }
    }

    result.push_str(rest);
    result
}

fn placeholder_value<'a>(token: &str, args: &'a [String], last_output: &'a str) -> Option<&'a str> {
    if token == LAST_OUTPUT {
        return Some(last_output);
    }

    let position: usize = token.strip_prefix(ARG_PREFIX)?.parse().ok()?;
    position
        .checked_sub(1)
        .and_then(|index| args.get(index))
        .map(String::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn test_substitutes_every_occurrence() {
        let script = "echo *#ARG_1#* *#ARG_2#*\necho *#ARG_1#* again";
        assert_eq!(
            substitute(script, &args(&["x", "y"]), ""),
            "echo x y\necho x again"
        );
    }

    #[test]
    fn test_out_of_range_argument_left_untouched() {
        let script = "echo *#ARG_1#* *#ARG_3#* *#ARG_0#*";
        assert_eq!(
            substitute(script, &args(&["x", "y"]), ""),
            "echo x *#ARG_3#* *#ARG_0#*"
        );
    }

    #[test]
    fn test_last_output() {
        assert_eq!(
            substitute("echo 'got: *#LAST_OUTPUT#*'", &[], "hello"),
            "echo 'got: hello'"
        );
        assert_eq!(substitute("x*#LAST_OUTPUT#*y", &[], ""), "xy");
    }

    #[test]
    fn test_values_are_not_rescanned() {
        assert_eq!(
            substitute("*#ARG_1#* *#ARG_2#*", &args(&["*#ARG_2#*", "b"]), ""),
            "*#ARG_2#* b"
        );
    }

    #[test]
    fn test_unknown_and_unterminated_tokens() {
        assert_eq!(
            substitute("a *#HOME#* *#ARG_1#*", &args(&["x"]), ""),
            "a *#HOME#* x"
        );
        assert_eq!(substitute("a *#ARG_1", &args(&["x"]), ""), "a *#ARG_1");
        assert_eq!(
            substitute("*#junk *#ARG_1#*", &args(&["x"]), ""),
            "*#junk x"
        );
    }

    #[tokio::test]
    async fn test_prepare_writes_executable_copy() {
        let scripts = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        let script = scripts.path().join("greet.sh");
        std::fs::write(&script, "echo *#ARG_1#* *#ARG_2#* *#ARG_3#*").unwrap();

        let sandbox = Sandbox::create(work.path()).unwrap();
        let prepared = sandbox
            .prepare(&script, &args(&["x", "y"]), "")
            .await
            .unwrap();

        assert_eq!(prepared.parent().unwrap(), sandbox.path());
        assert_eq!(prepared.file_name().unwrap(), "greet.sh");
        assert_eq!(
            std::fs::read_to_string(&prepared).unwrap(),
            "echo x y *#ARG_3#*"
        );

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&prepared).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o755);
        }

        // Original is untouched
        assert_eq!(
            std::fs::read_to_string(&script).unwrap(),
            "echo *#ARG_1#* *#ARG_2#* *#ARG_3#*"
        );
    }

    #[tokio::test]
    async fn test_prepare_missing_script() {
        let work = tempfile::tempdir().unwrap();
        let sandbox = Sandbox::create(work.path()).unwrap();

        let err = sandbox
            .prepare(Path::new("/nonexistent/script.sh"), &[], "")
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::ScriptRead { .. }));
    }

    #[test]
    fn test_close_removes_directory() {
        let work = tempfile::tempdir().unwrap();
        let sandbox = Sandbox::create(&work.path().join("nested")).unwrap();
        let path = sandbox.path().to_path_buf();
        assert!(path.is_dir());
        assert!(
            path.file_name()
                .unwrap()
                .to_string_lossy()
                .starts_with("relay-")
        );

        sandbox.close();
        assert!(!path.exists());
        assert_eq!(std::fs::read_dir(work.path().join("nested")).unwrap().count(), 0);
    }

    #[test]
    fn test_drop_removes_directory() {
        let work = tempfile::tempdir().unwrap();
        let path = {
            let sandbox = Sandbox::create(work.path()).unwrap();
            sandbox.path().to_path_buf()
        };
        assert!(!path.exists());
    }
}
