//! External tool command builder and runner.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::error::{MediaError, MediaResult};

/// How many stderr lines are retained for diagnostics. The first lines carry
/// the actual error; the rest is usually progress spam.
pub const STDERR_TAIL_LINES: usize = 5;

/// A command to run against one of the external tools.
#[derive(Debug, Clone)]
pub struct ToolCommand {
    program: String,
    args: Vec<String>,
    /// When set, a nonzero exit is downgraded to success if this file exists
    /// and is nonempty (ffmpeg exits nonzero on routine warnings).
    expected_output: Option<PathBuf>,
}

impl ToolCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            expected_output: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Treat a nonzero exit as success if this output file was produced.
    pub fn expect_output(mut self, path: impl AsRef<Path>) -> Self {
        self.expected_output = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn build_args(&self) -> &[String] {
        &self.args
    }
}

/// Captured result of a tool run.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub exit_code: i32,
    pub stdout: String,
    /// First few stderr lines, newline-joined
    pub stderr_tail: String,
}

/// Runner for external tools with cancellation, timeout, and bounded capture.
pub struct ToolRunner {
    cancel_rx: Option<watch::Receiver<bool>>,
    timeout_secs: Option<u64>,
}

impl Default for ToolRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRunner {
    pub fn new() -> Self {
        Self {
            cancel_rx: None,
            timeout_secs: None,
        }
    }

    /// Set the cancellation signal. Flipping the sender to `true` kills the
    /// child and surfaces `MediaError::Canceled`.
    pub fn with_cancel(mut self, cancel_rx: watch::Receiver<bool>) -> Self {
        self.cancel_rx = Some(cancel_rx);
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    /// Run a command to completion, capturing stdout and the stderr tail.
    pub async fn run(&self, cmd: &ToolCommand) -> MediaResult<ToolOutput> {
        self.run_inner(cmd, None).await
    }

    /// Run a command, invoking `on_stderr_line` for every stderr line as it
    /// arrives. Used for the decode stage, where the tool reports progress on
    /// stderr.
    pub async fn spawn_streaming<F>(
        &self,
        cmd: &ToolCommand,
        on_stderr_line: F,
    ) -> MediaResult<ToolOutput>
    where
        F: Fn(&str) + Send + 'static,
    {
        self.run_inner(cmd, Some(Box::new(on_stderr_line))).await
    }

    async fn run_inner(
        &self,
        cmd: &ToolCommand,
        on_stderr_line: Option<Box<dyn Fn(&str) + Send>>,
    ) -> MediaResult<ToolOutput> {
        debug!(tool = %cmd.program, args = ?cmd.args, "spawning external tool");

        let mut child = Command::new(&cmd.program)
            .args(&cmd.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    MediaError::tool_failed(&cmd.program, "not found in PATH", None, None)
                } else {
                    MediaError::Io(e)
                }
            })?;

        let stdout = child.stdout.take().expect("stdout not captured");
        let stderr = child.stderr.take().expect("stderr not captured");

        let stdout_task = tokio::spawn(async move {
            let mut buf = String::new();
            let mut reader = BufReader::new(stdout);
            let _ = reader.read_to_string(&mut buf).await;
            buf
        });

        let stderr_task = tokio::spawn(async move {
            let mut tail: Vec<String> = Vec::with_capacity(STDERR_TAIL_LINES);
            let mut reader = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = reader.next_line().await {
                if let Some(cb) = on_stderr_line.as_deref() {
                    cb(&line);
                }
                if tail.len() < STDERR_TAIL_LINES {
                    tail.push(line);
                }
            }
            tail.join("\n")
        });

        let status = self.wait_for_exit(&mut child).await;

        let stdout = stdout_task.await.unwrap_or_default();
        let stderr_tail = stderr_task.await.unwrap_or_default();

        let status = match status {
            Ok(s) => s,
            Err(e) => return Err(e),
        };

        let exit_code = status.code().unwrap_or(-1);

        if status.success() {
            return Ok(ToolOutput {
                exit_code,
                stdout,
                stderr_tail,
            });
        }

        // ffmpeg routinely exits nonzero after emitting warnings while still
        // producing a usable file.
        if let Some(expected) = &cmd.expected_output {
            if file_is_nonempty(expected).await {
                warn!(
                    tool = %cmd.program,
                    exit_code,
                    output = %expected.display(),
                    "tool exited nonzero but produced output, treating as success"
                );
                return Ok(ToolOutput {
                    exit_code,
                    stdout,
                    stderr_tail,
                });
            }
        }

        Err(MediaError::tool_failed(
            &cmd.program,
            "exited with non-zero status",
            Some(stderr_tail),
            Some(exit_code),
        ))
    }

    /// Wait for the child, honoring timeout and the cancel signal.
    async fn wait_for_exit(&self, child: &mut Child) -> MediaResult<std::process::ExitStatus> {
        let timeout_secs = self.timeout_secs;
        let mut cancel_rx = self.cancel_rx.clone();

        let timed_out = async move {
            match timeout_secs {
                Some(secs) => tokio::time::sleep(std::time::Duration::from_secs(secs)).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(timed_out);

        let canceled = async {
            match cancel_rx.as_mut() {
                Some(rx) => loop {
                    if *rx.borrow() {
                        return;
                    }
                    if rx.changed().await.is_err() {
                        // Sender gone: cancellation can no longer arrive.
                        std::future::pending::<()>().await;
                    }
                },
                None => std::future::pending().await,
            }
        };
        tokio::pin!(canceled);

        tokio::select! {
            status = child.wait() => Ok(status?),
            _ = &mut timed_out => {
                let secs = timeout_secs.unwrap_or_default();
                warn!("external tool timed out after {secs}s, killing");
                let _ = child.kill().await;
                Err(MediaError::Timeout(secs))
            }
            _ = &mut canceled => {
                debug!("cancel signal received, killing external tool");
                let _ = child.kill().await;
                Err(MediaError::Canceled)
            }
        }
    }
}

async fn file_is_nonempty(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_file() && m.len() > 0)
        .unwrap_or(false)
}

/// Verify that all required external tools are on PATH.
///
/// Returns the resolved paths so the caller can log them at startup.
pub fn check_tools() -> MediaResult<Vec<PathBuf>> {
    let mut resolved = Vec::with_capacity(3);
    for tool in ["ffmpeg", "ffprobe", "fpcalc"] {
        let path = which::which(tool).map_err(|_| match tool {
            "ffmpeg" => MediaError::ToolNotFound("ffmpeg"),
            "ffprobe" => MediaError::ToolNotFound("ffprobe"),
            _ => MediaError::ToolNotFound("fpcalc"),
        })?;
        resolved.push(path);
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_builder_collects_args() {
        let cmd = ToolCommand::new("ffmpeg")
            .arg("-y")
            .args(["-i", "input.mkv"])
            .arg("out.wav");
        assert_eq!(cmd.program(), "ffmpeg");
        assert_eq!(cmd.build_args(), ["-y", "-i", "input.mkv", "out.wav"]);
    }

    #[tokio::test]
    async fn run_captures_stdout_and_exit() {
        let cmd = ToolCommand::new("sh").args(["-c", "echo hello; echo err >&2"]);
        let out = ToolRunner::new().run(&cmd).await.unwrap();
        assert_eq!(out.exit_code, 0);
        assert_eq!(out.stdout.trim(), "hello");
        assert_eq!(out.stderr_tail, "err");
    }

    #[tokio::test]
    async fn stderr_tail_is_bounded() {
        let cmd = ToolCommand::new("sh").args(["-c", "for i in 1 2 3 4 5 6 7 8; do echo line$i >&2; done"]);
        let out = ToolRunner::new().run(&cmd).await.unwrap();
        assert_eq!(out.stderr_tail.lines().count(), STDERR_TAIL_LINES);
        assert!(out.stderr_tail.starts_with("line1"));
    }

    #[tokio::test]
    async fn nonzero_exit_is_an_error_without_output() {
        let cmd = ToolCommand::new("sh").args(["-c", "echo boom >&2; exit 3"]);
        let err = ToolRunner::new().run(&cmd).await.unwrap_err();
        match err {
            MediaError::ToolFailed {
                exit_code,
                stderr_tail,
                ..
            } => {
                assert_eq!(exit_code, Some(3));
                assert_eq!(stderr_tail.as_deref(), Some("boom"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn nonzero_exit_with_output_is_success() {
        let dir = tempfile::TempDir::new().unwrap();
        let out_file = dir.path().join("out.wav");
        std::fs::write(&out_file, b"RIFF").unwrap();

        let cmd = ToolCommand::new("sh")
            .args(["-c", "exit 1"])
            .expect_output(&out_file);
        let out = ToolRunner::new().run(&cmd).await.unwrap();
        assert_eq!(out.exit_code, 1);
    }

    #[tokio::test]
    async fn timeout_kills_the_child() {
        let cmd = ToolCommand::new("sleep").arg("30");
        let err = ToolRunner::new().with_timeout(1).run(&cmd).await.unwrap_err();
        assert!(matches!(err, MediaError::Timeout(1)));
    }

    #[tokio::test]
    async fn cancel_kills_the_child() {
        let (tx, rx) = watch::channel(false);
        let cmd = ToolCommand::new("sleep").arg("30");
        let runner = ToolRunner::new().with_cancel(rx);

        let handle = tokio::spawn(async move { runner.run(&cmd).await });
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        tx.send(true).unwrap();

        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, MediaError::Canceled));
    }

    #[tokio::test]
    async fn streaming_sees_stderr_lines() {
        use std::sync::{Arc, Mutex};

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);

        let cmd = ToolCommand::new("sh").args(["-c", "echo a >&2; echo b >&2"]);
        ToolRunner::new()
            .spawn_streaming(&cmd, move |line| {
                seen_clone.lock().unwrap().push(line.to_string());
            })
            .await
            .unwrap();

        assert_eq!(*seen.lock().unwrap(), vec!["a", "b"]);
    }
}
