//! Streaming data transfer between local files and a tape drive.

use crate::error::{ErrorKind, Result};
use crate::exec::CommandExecutor;
use crate::parse::parse_transfer_summary;
use async_trait::async_trait;
use exn::ResultExt;
use std::path::{Path, PathBuf};
use tracing::instrument;

/// Transfers whole files to and from the current position of one drive.
///
/// Transfers are long-running (minutes for a large container); they are
/// cancelled on shutdown by terminating the subprocess.
#[async_trait]
pub trait ReadWriteService: Send + Sync {
    /// Write `source` as one tape file at the current position; returns bytes written.
    async fn write_file(&self, source: &Path) -> Result<u64>;

    /// Read the tape file at the current position into `destination`; returns bytes read.
    async fn read_file(&self, destination: &Path) -> Result<u64>;
}

/// [`ReadWriteService`] backed by `dd`.
#[derive(Debug, Clone)]
pub struct DdReadWriteService {
    dd: PathBuf,
    device: PathBuf,
    block_size: u64,
    executor: CommandExecutor,
}
impl DdReadWriteService {
    pub fn new(dd: impl Into<PathBuf>, device: impl Into<PathBuf>, block_size: u64, executor: CommandExecutor) -> Self {
        Self { dd: dd.into(), device: device.into(), block_size, executor }
    }

    async fn dd(&self, input: &Path, output: &Path) -> Result<u64> {
        let args = [
            format!("if={}", input.display()),
            format!("of={}", output.display()),
            format!("bs={}", self.block_size),
        ];
        let output = self.executor.execute(&self.dd, args).await?.into_success()?;
        // dd reports on stderr, even on success.
        let summary = parse_transfer_summary(&output.stderr)?;
        Ok(summary.bytes)
    }
}

#[async_trait]
impl ReadWriteService for DdReadWriteService {
    #[instrument(skip(self), fields(device = %self.device.display()))]
    async fn write_file(&self, source: &Path) -> Result<u64> {
        let expected = tokio::fs::metadata(source).await.or_raise(|| ErrorKind::Io)?.len();
        let written = self.dd(source, &self.device).await?;
        if written != expected {
            // A short write without an error exit still means the tape file is incomplete.
            exn::bail!(ErrorKind::ExitStatus {
                program: self.dd.display().to_string(),
                code: Some(0),
                stderr: format!("short write: {written} of {expected} bytes"),
            });
        }
        tracing::debug!(bytes = written, "file written to tape");
        Ok(written)
    }

    #[instrument(skip(self), fields(device = %self.device.display()))]
    async fn read_file(&self, destination: &Path) -> Result<u64> {
        let read = self.dd(&self.device, destination).await?;
        tracing::debug!(bytes = read, "file read from tape");
        Ok(read)
    }
}
