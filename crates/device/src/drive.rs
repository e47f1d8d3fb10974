//! Drive control.

use crate::error::Result;
use crate::exec::CommandExecutor;
use crate::parse::{DriveStatus, parse_drive_status};
use async_trait::async_trait;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};

/// Commands addressed to one physical tape drive.
///
/// A failure (non-zero exit, timeout, unparseable output) is always reported
/// as an error; implementations never return a partial status.
#[async_trait]
pub trait DriveCommandService: Send + Sync {
    /// Device node, for logging.
    fn device(&self) -> &Path;

    async fn status(&self) -> Result<DriveStatus>;

    async fn rewind(&self) -> Result<()>;

    /// Rewind and take the drive offline so the robot can remove the cartridge.
    async fn eject(&self) -> Result<()>;

    /// Position the head at the start of file number `file` (0 being the beginning of tape).
    async fn position(&self, file: u64) -> Result<()>;
}

/// [`DriveCommandService`] backed by `mt`.
#[derive(Debug, Clone)]
pub struct MtDriveCommandService {
    mt: PathBuf,
    device: PathBuf,
    executor: CommandExecutor,
}
impl MtDriveCommandService {
    pub fn new(mt: impl Into<PathBuf>, device: impl Into<PathBuf>, executor: CommandExecutor) -> Self {
        Self { mt: mt.into(), device: device.into(), executor }
    }

    async fn mt(&self, args: &[&str]) -> Result<String> {
        let mut argv = vec![OsStr::new("-f"), self.device.as_os_str()];
        argv.extend(args.iter().map(|arg| OsStr::new(*arg)));
        let output = self.executor.execute(&self.mt, argv).await?.into_success()?;
        Ok(output.stdout)
    }
}

#[async_trait]
impl DriveCommandService for MtDriveCommandService {
    fn device(&self) -> &Path {
        &self.device
    }

    async fn status(&self) -> Result<DriveStatus> {
        let stdout = self.mt(&["status"]).await?;
        parse_drive_status(&stdout)
    }

    async fn rewind(&self) -> Result<()> {
        self.mt(&["rewind"]).await.map(drop)
    }

    async fn eject(&self) -> Result<()> {
        self.mt(&["offline"]).await.map(drop)
    }

    async fn position(&self, file: u64) -> Result<()> {
        if file == 0 {
            return self.rewind().await;
        }
        self.mt(&["asf", &file.to_string()]).await.map(drop)
    }
}
