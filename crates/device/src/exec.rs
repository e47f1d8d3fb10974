//! External command execution.
//!
//! Every interaction with the hardware goes through a subprocess (`mt`, `mtx`,
//! `dd`). The executor runs one program to completion and captures its output,
//! with two ways of stopping early:
//! - the per-call timeout elapses: the process is killed and reaped, and
//!   [`ErrorKind::Timeout`] is returned.
//! - the shutdown token is cancelled: the process is given the configured
//!   grace period to finish on its own, then killed and reaped, and
//!   [`ErrorKind::Cancelled`] is returned.
//!
//! The process is always reaped before this returns, so a caller holding a
//! device handle can only give it back once nothing is touching the device.

use crate::error::{ErrorKind, Result};
use exn::ResultExt;
use std::ffi::{OsStr, OsString};
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

/// Captured result of a finished external program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub program: String,
    /// `None` when the process was killed by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}
impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Treat any non-zero exit as a failure.
    pub fn into_success(self) -> Result<Self> {
        if !self.success() {
            exn::bail!(ErrorKind::ExitStatus { program: self.program, code: self.code, stderr: self.stderr });
        }
        Ok(self)
    }
}

enum Outcome {
    Exited(std::io::Result<ExitStatus>),
    TimedOut,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct CommandExecutor {
    timeout: Duration,
    grace: Duration,
    shutdown: CancellationToken,
}

impl CommandExecutor {
    pub fn new(timeout: Duration, grace: Duration, shutdown: CancellationToken) -> Self {
        Self { timeout, grace, shutdown }
    }

    /// Same executor, different per-call timeout.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        Self { timeout, ..self.clone() }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    #[instrument(skip_all, fields(program = %program.display()))]
    pub async fn execute<I, S>(&self, program: &Path, args: I) -> Result<CommandOutput>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let name = program.display().to_string();
        if self.shutdown.is_cancelled() {
            exn::bail!(ErrorKind::ShuttingDown);
        }
        let args: Vec<OsString> = args.into_iter().map(|arg| arg.as_ref().to_os_string()).collect();
        tracing::debug!(?args, timeout = ?self.timeout, "executing external command");
        let mut child = Command::new(program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .or_raise(|| ErrorKind::Spawn(name.clone()))?;
        let stdout = child.stdout.take().map(|pipe| tokio::spawn(drain(pipe)));
        let stderr = child.stderr.take().map(|pipe| tokio::spawn(drain(pipe)));

        let outcome = tokio::select! {
            status = child.wait() => Outcome::Exited(status),
            () = tokio::time::sleep(self.timeout) => Outcome::TimedOut,
            () = self.shutdown.cancelled() => Outcome::Cancelled,
        };
        let status = match outcome {
            Outcome::Exited(status) => status.or_raise(|| ErrorKind::Io)?,
            Outcome::TimedOut => {
                tracing::warn!(timeout = ?self.timeout, "external command timed out; killing it");
                terminate(&mut child, [stdout, stderr]).await;
                exn::bail!(ErrorKind::Timeout(name));
            },
            Outcome::Cancelled => {
                tracing::info!(grace = ?self.grace, "shutdown requested; waiting for external command to finish");
                match tokio::time::timeout(self.grace, child.wait()).await {
                    Ok(status) => status.or_raise(|| ErrorKind::Io)?,
                    Err(_) => {
                        tracing::warn!("external command still running after grace period; killing it");
                        terminate(&mut child, [stdout, stderr]).await;
                        exn::bail!(ErrorKind::Cancelled(name));
                    },
                }
            },
        };

        let output = CommandOutput {
            program: name,
            code: status.code(),
            stdout: collect(stdout).await,
            stderr: collect(stderr).await,
        };
        tracing::debug!(code = ?output.code, "external command finished");
        Ok(output)
    }
}

async fn drain<R: AsyncRead + Unpin>(mut pipe: R) -> String {
    let mut buffer = Vec::new();
    // Whatever was read before a broken pipe is still worth reporting.
    _ = pipe.read_to_end(&mut buffer).await;
    String::from_utf8_lossy(&buffer).into_owned()
}

async fn collect(reader: Option<JoinHandle<String>>) -> String {
    match reader {
        Some(handle) => handle.await.unwrap_or_default(),
        None => String::new(),
    }
}

/// Kill and reap the child. Readers are aborted rather than awaited: an
/// orphaned grandchild may keep the pipes open indefinitely.
async fn terminate(child: &mut Child, readers: [Option<JoinHandle<String>>; 2]) {
    if let Err(err) = child.kill().await {
        tracing::error!(error = %err, "could not kill external command");
    }
    for reader in readers.into_iter().flatten() {
        reader.abort();
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Instant;

    const SH: &str = "/bin/sh";

    fn executor(timeout: Duration) -> CommandExecutor {
        CommandExecutor::new(timeout, Duration::from_millis(100), CancellationToken::new())
    }

    #[tokio::test]
    async fn test_captures_output_and_exit_code() {
        let output = executor(Duration::from_secs(5))
            .execute(Path::new(SH), ["-c", "echo hello; echo oops >&2"])
            .await
            .unwrap();
        assert!(output.success());
        assert_eq!(output.stdout, "hello\n");
        assert_eq!(output.stderr, "oops\n");
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_reported() {
        let output = executor(Duration::from_secs(5))
            .execute(Path::new(SH), ["-c", "echo broken >&2; exit 3"])
            .await
            .unwrap();
        assert_eq!(output.code, Some(3));
        let err = output.into_success().unwrap_err();
        assert!(matches!(&*err, ErrorKind::ExitStatus { code: Some(3), stderr, .. } if stderr == "broken\n"));
    }

    #[tokio::test]
    async fn test_timeout_kills_process() {
        let started = Instant::now();
        let err = executor(Duration::from_millis(100))
            .execute(Path::new(SH), ["-c", "sleep 5"])
            .await
            .unwrap_err();
        assert!(matches!(&*err, ErrorKind::Timeout(_)));
        assert!(err.is_retryable());
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_missing_program() {
        let err = executor(Duration::from_secs(1))
            .execute(Path::new("/nonexistent/reel-test-tool"), ["status"])
            .await
            .unwrap_err();
        assert!(matches!(&*err, ErrorKind::Spawn(_)));
    }

    #[tokio::test]
    async fn test_refuses_after_shutdown() {
        let token = CancellationToken::new();
        token.cancel();
        let executor = CommandExecutor::new(Duration::from_secs(1), Duration::from_secs(1), token);
        let err = executor.execute(Path::new(SH), ["-c", "true"]).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::ShuttingDown));
    }

    #[tokio::test]
    async fn test_shutdown_terminates_after_grace() {
        let token = CancellationToken::new();
        let executor = CommandExecutor::new(Duration::from_secs(30), Duration::from_millis(100), token.clone());
        let cancel = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            token.cancel();
        });
        let started = Instant::now();
        let err = executor.execute(Path::new(SH), ["-c", "sleep 5"]).await.unwrap_err();
        cancel.await.unwrap();
        assert!(matches!(&*err, ErrorKind::Cancelled(_)));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_shutdown_lets_command_finish_within_grace() {
        let token = CancellationToken::new();
        let executor = CommandExecutor::new(Duration::from_secs(30), Duration::from_secs(10), token.clone());
        let cancel = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            token.cancel();
        });
        let output = executor.execute(Path::new(SH), ["-c", "sleep 0.3; echo done"]).await.unwrap();
        cancel.await.unwrap();
        assert!(output.success());
        assert_eq!(output.stdout, "done\n");
    }
}
