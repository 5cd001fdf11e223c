//! Process runner
//!
//! Launches a prepared script with the interpreter its extension maps to,
//! streams its output line by line and waits for it to exit. On unix the
//! child leads its own process group, and a stop request kills that whole
//! group so nothing the script started outlives it.

use relay_core::domain::output::{OutputLine, OutputStream};
use std::path::Path;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader, Split};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::StderrMode;
use crate::error::{Result, TaskError};
use crate::stop::{StopAck, StopListener};

/// Destination for live output lines
pub type OutputSink = mpsc::Sender<OutputLine>;

/// Creates an output sink and the receiver observers read from
///
/// The runner waits for capacity on every line, so a consumer that stops
/// reading stalls the pipeline once `capacity` lines are buffered.
pub fn output_channel(capacity: usize) -> (OutputSink, mpsc::Receiver<OutputLine>) {
    mpsc::channel(capacity)
}

/// Interpreter selected by script extension
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interpreter {
    /// `.sh`, run with `bash <script>`
    Bash,
    /// `.py`, run with `python3 <script>`
    Python,
    /// `.go`, run with `go run <script>`
    Go,
}

impl Interpreter {
    /// Picks the interpreter for a script path
    pub fn from_path(script: &Path) -> Result<Self> {
        match script.extension().and_then(|ext| ext.to_str()) {
            Some("sh") => Ok(Interpreter::Bash),
            Some("py") => Ok(Interpreter::Python),
            Some("go") => Ok(Interpreter::Go),
            _ => Err(TaskError::UnsupportedScriptType(script.to_path_buf())),
        }
    }

    pub fn program(&self) -> &'static str {
        match self {
            Interpreter::Bash => "bash",
            Interpreter::Python => "python3",
            Interpreter::Go => "go",
        }
    }

    /// Builds the invocation for `script`
    pub fn command(&self, script: &Path) -> Command {
        let mut command = Command::new(self.program());
        if let Interpreter::Go = self {
            command.arg("run");
        }
        command.arg(script);
        command
    }
}

impl std::fmt::Display for Interpreter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Interpreter::Go => write!(f, "go run"),
            other => write!(f, "{}", other.program()),
        }
    }
}

/// Identifies the command being run, for output events and env vars
#[derive(Debug, Clone, Copy)]
pub struct RunTarget<'a> {
    pub task_id: Uuid,
    pub command_index: usize,
    pub command_name: &'a str,
}

/// Runs prepared scripts as child processes
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner {
    stderr_mode: StderrMode,
}

type LineReader<R> = Split<BufReader<R>>;

enum Event {
    Line(OutputStream, std::io::Result<Option<Vec<u8>>>),
    Stop(StopAck),
}

impl ProcessRunner {
    pub fn new(stderr_mode: StderrMode) -> Self {
        Self { stderr_mode }
    }

    pub fn stderr_mode(&self) -> StderrMode {
        self.stderr_mode
    }

    /// Runs `script` inside `sandbox_dir` until it exits
    ///
    /// Every captured line is appended to `captured` and sent to `sink`.
    /// `captured` keeps whatever was read even when an error is returned.
    ///
    /// # Errors
    /// * `UnsupportedScriptType` - no interpreter for the extension
    /// * `ProcessStart` - the interpreter could not be spawned
    /// * `ProcessFailed` - non-zero exit
    /// * `Stopped` - a stop request killed the process
    pub async fn run(
        &self,
        script: &Path,
        sandbox_dir: &Path,
        target: RunTarget<'_>,
        sink: Option<&OutputSink>,
        stop: &mut StopListener,
        captured: &mut String,
    ) -> Result<()> {
        let interpreter = Interpreter::from_path(script)?;

        // Nothing spawned yet, so a queued stop needs no kill
        if let Some(ack) = stop.pending() {
            stop.accept(ack);
            return Err(TaskError::Stopped);
        }

        let mut command = interpreter.command(script);
        command
            .current_dir(sandbox_dir)
            .env("RELAY_TASK_ID", target.task_id.to_string())
            .env("RELAY_COMMAND_INDEX", target.command_index.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(match self.stderr_mode {
                StderrMode::Discard => Stdio::null(),
                StderrMode::Merge => Stdio::piped(),
                StderrMode::Inherit => Stdio::inherit(),
            })
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(|source| TaskError::ProcessStart {
            program: interpreter.program().to_string(),
            source,
        })?;

        debug!(
            "Started {} {} (pid {:?})",
            interpreter,
            script.display(),
            child.id()
        );

        let mut stdout = child
            .stdout
            .take()
            .map(|out| BufReader::new(out).split(b'\n'));
        let mut stderr = child
            .stderr
            .take()
            .map(|err| BufReader::new(err).split(b'\n'));

        while stdout.is_some() || stderr.is_some() {
            let event = tokio::select! {
                line = next_line(&mut stdout) => Event::Line(OutputStream::Stdout, line),
                line = next_line(&mut stderr) => Event::Line(OutputStream::Stderr, line),
                ack = stop.requested() => Event::Stop(ack),
            };

            match event {
                Event::Line(stream, Ok(Some(bytes))) => {
                    let line = decode_line(bytes);
                    captured.push_str(&line);
                    captured.push('\n');
                    if let Some(ack) = forward(sink, target, stream, line, stop).await {
                        if kill(&mut child, ack, stop).await {
                            return Err(TaskError::Stopped);
                        }
                    }
                }
                Event::Line(OutputStream::Stdout, Ok(None)) => stdout = None,
                Event::Line(OutputStream::Stderr, Ok(None)) => stderr = None,
                Event::Line(_, Err(e)) => {
                    let _ = terminate(&mut child).await;
                    return Err(TaskError::ProcessIo(e));
                }
                Event::Stop(ack) => {
                    if kill(&mut child, ack, stop).await {
                        return Err(TaskError::Stopped);
                    }
                }
            }
        }

        let status = loop {
            let ack = tokio::select! {
                status = child.wait() => break status.map_err(TaskError::ProcessIo)?,
                ack = stop.requested() => ack,
            };

            if kill(&mut child, ack, stop).await {
                return Err(TaskError::Stopped);
            }
        };

        if status.success() {
            debug!("{} exited successfully", script.display());
            Ok(())
        } else {
            // No code means the process died from a signal
            let exit_code = status.code().unwrap_or(-1);
            debug!("{} exited with code {}", script.display(), exit_code);
            Err(TaskError::ProcessFailed { exit_code })
        }
    }
}

/// Reads the next line, pending forever once the stream is closed
async fn next_line<R: AsyncRead + Unpin>(
    reader: &mut Option<LineReader<R>>,
) -> std::io::Result<Option<Vec<u8>>> {
    match reader {
        Some(lines) => lines.next_segment().await,
        None => std::future::pending().await,
    }
}

fn decode_line(mut bytes: Vec<u8>) -> String {
    if bytes.last() == Some(&b'\r') {
        bytes.pop();
    }
    String::from_utf8_lossy(&bytes).into_owned()
}

/// Sends a line to the sink
///
/// Waiting for sink capacity is abandoned when a stop request arrives; the
/// request is returned and the line is dropped.
async fn forward(
    sink: Option<&OutputSink>,
    target: RunTarget<'_>,
    stream: OutputStream,
    line: String,
    stop: &mut StopListener,
) -> Option<StopAck> {
    let sink = sink?;

    let event = OutputLine {
        task_id: target.task_id,
        command_index: target.command_index,
        command: target.command_name.to_string(),
        stream,
        line,
    };

    tokio::select! {
        sent = sink.send(event) => {
            if sent.is_err() {
                debug!("Output receiver for task {} is gone", target.task_id);
            }
            None
        }
        ack = stop.requested() => Some(ack),
    }
}

/// Kills the child and accepts the stop request
///
/// A failed kill is reported to the requester right away. Returns `false`
/// in that case, with the process still running.
async fn kill(child: &mut Child, ack: StopAck, stop: &mut StopListener) -> bool {
    let pid = child.id();
    match terminate(child).await {
        Ok(()) => {
            debug!("Killed process group {:?} on stop request", pid);
            stop.accept(ack);
            true
        }
        Err(e) => {
            warn!("Failed to kill process group {:?}: {}", pid, e);
            let _ = ack.send(Err(e));
            false
        }
    }
}

/// Kills the child's process group and reaps the child
#[cfg(unix)]
async fn terminate(child: &mut Child) -> std::io::Result<()> {
    // Already reaped
    let Some(pid) = child.id() else {
        return Ok(());
    };

    kill_process_group(pid)?;
    child.wait().await?;
    Ok(())
}

#[cfg(not(unix))]
async fn terminate(child: &mut Child) -> std::io::Result<()> {
    child.kill().await
}

#[cfg(unix)]
fn kill_process_group(pgid: u32) -> std::io::Result<()> {
    let pgid = libc::pid_t::try_from(pgid).map_err(std::io::Error::other)?;

    // SAFETY: killpg takes plain integers and touches no memory
    if unsafe { libc::killpg(pgid, libc::SIGKILL) } == 0 {
        return Ok(());
    }

    let err = std::io::Error::last_os_error();
    // Every member already exited
    if err.raw_os_error() == Some(libc::ESRCH) {
        Ok(())
    } else {
        Err(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stop::stop_channel;
    use std::path::PathBuf;
    use std::time::Duration;

    fn target(task_id: Uuid) -> RunTarget<'static> {
        RunTarget {
            task_id,
            command_index: 0,
            command_name: "test",
        }
    }

    fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn test_interpreter_by_extension() {
        assert_eq!(
            Interpreter::from_path(Path::new("a/b.sh")).unwrap(),
            Interpreter::Bash
        );
        assert_eq!(
            Interpreter::from_path(Path::new("b.py")).unwrap(),
            Interpreter::Python
        );
        assert_eq!(
            Interpreter::from_path(Path::new("main.go")).unwrap(),
            Interpreter::Go
        );
        assert!(matches!(
            Interpreter::from_path(Path::new("run.rb")),
            Err(TaskError::UnsupportedScriptType(_))
        ));
        assert!(matches!(
            Interpreter::from_path(Path::new("Makefile")),
            Err(TaskError::UnsupportedScriptType(_))
        ));
    }

    #[test]
    fn test_go_invocation() {
        let command = Interpreter::Go.command(Path::new("main.go"));
        let std_command = command.as_std();
        assert_eq!(std_command.get_program(), "go");
        let args: Vec<_> = std_command.get_args().collect();
        assert_eq!(args, vec!["run", "main.go"]);
    }

    #[tokio::test]
    async fn test_streams_stdout_lines() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "lines.sh", "echo one\necho two\necho oops >&2\n");
        let (sink, mut rx) = output_channel(16);
        let task_id = Uuid::new_v4();
        let mut captured = String::new();

        ProcessRunner::default()
            .run(
                &script,
                dir.path(),
                target(task_id),
                Some(&sink),
                &mut StopListener::detached(),
                &mut captured,
            )
            .await
            .unwrap();

        assert_eq!(captured, "one\ntwo\n");

        let first = rx.recv().await.unwrap();
        assert_eq!(first.line, "one");
        assert_eq!(first.task_id, task_id);
        assert_eq!(first.stream, OutputStream::Stdout);
        assert_eq!(rx.recv().await.unwrap().line, "two");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_merged_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "err.sh", "echo oops >&2\n");
        let (sink, mut rx) = output_channel(16);
        let mut captured = String::new();

        ProcessRunner::new(StderrMode::Merge)
            .run(
                &script,
                dir.path(),
                target(Uuid::new_v4()),
                Some(&sink),
                &mut StopListener::detached(),
                &mut captured,
            )
            .await
            .unwrap();

        assert_eq!(captured, "oops\n");
        assert_eq!(rx.recv().await.unwrap().stream, OutputStream::Stderr);
    }

    #[tokio::test]
    async fn test_runs_in_sandbox_directory() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "pwd.sh", "pwd\necho $RELAY_COMMAND_INDEX\n");
        let mut captured = String::new();

        ProcessRunner::default()
            .run(
                &script,
                dir.path(),
                target(Uuid::new_v4()),
                None,
                &mut StopListener::detached(),
                &mut captured,
            )
            .await
            .unwrap();

        let expected = dir.path().canonicalize().unwrap();
        let mut lines = captured.lines();
        assert_eq!(
            Path::new(lines.next().unwrap()).canonicalize().unwrap(),
            expected
        );
        assert_eq!(lines.next(), Some("0"));
    }

    #[tokio::test]
    async fn test_non_zero_exit_keeps_partial_output() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "fail.sh", "echo before\nexit 3\n");
        let mut captured = String::new();

        let err = ProcessRunner::default()
            .run(
                &script,
                dir.path(),
                target(Uuid::new_v4()),
                None,
                &mut StopListener::detached(),
                &mut captured,
            )
            .await
            .unwrap_err();

        assert!(matches!(err, TaskError::ProcessFailed { exit_code: 3 }));
        assert_eq!(captured, "before\n");
    }

    #[tokio::test]
    async fn test_unsupported_extension_spawns_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "run.rb", "puts 1\n");
        let mut captured = String::new();

        let err = ProcessRunner::default()
            .run(
                &script,
                dir.path(),
                target(Uuid::new_v4()),
                None,
                &mut StopListener::detached(),
                &mut captured,
            )
            .await
            .unwrap_err();

        assert!(matches!(err, TaskError::UnsupportedScriptType(_)));
    }

    #[tokio::test]
    async fn test_stop_kills_running_process() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "sleep.sh", "echo started\nsleep 30\n");
        let (handle, mut listener) = stop_channel();
        let (sink, mut rx) = output_channel(16);
        let script_dir = dir.path().to_path_buf();

        let run = tokio::spawn(async move {
            let mut captured = String::new();
            let result = ProcessRunner::default()
                .run(
                    &script,
                    &script_dir,
                    target(Uuid::new_v4()),
                    Some(&sink),
                    &mut listener,
                    &mut captured,
                )
                .await;
            listener.confirm();
            (result, captured)
        });

        // Process is live once its first line arrives
        assert_eq!(rx.recv().await.unwrap().line, "started");
        assert!(handle.request_stop().await.unwrap());

        let (result, captured) = tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(TaskError::Stopped)));
        assert_eq!(captured, "started\n");
    }
}
