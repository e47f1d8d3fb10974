//! Robot (medium changer) control.

use crate::error::Result;
use crate::exec::CommandExecutor;
use crate::parse::{LibraryStatus, parse_library_status};
use async_trait::async_trait;
use std::path::{Path, PathBuf};

/// Commands addressed to a tape library's robotic loader.
#[async_trait]
pub trait RobotCommandService: Send + Sync {
    fn device(&self) -> &Path;

    /// Inventory of drives and storage slots.
    async fn status(&self) -> Result<LibraryStatus>;

    /// Move the cartridge in storage slot `slot` into drive `drive`.
    async fn load(&self, slot: u32, drive: u32) -> Result<()>;

    /// Move the cartridge in drive `drive` back into (empty) storage slot `slot`.
    async fn unload(&self, slot: u32, drive: u32) -> Result<()>;
}

/// [`RobotCommandService`] backed by `mtx`.
#[derive(Debug, Clone)]
pub struct MtxRobotCommandService {
    mtx: PathBuf,
    device: PathBuf,
    executor: CommandExecutor,
}
impl MtxRobotCommandService {
    pub fn new(mtx: impl Into<PathBuf>, device: impl Into<PathBuf>, executor: CommandExecutor) -> Self {
        Self { mtx: mtx.into(), device: device.into(), executor }
    }

    async fn mtx(&self, args: &[String]) -> Result<String> {
        let mut argv = vec!["-f".to_string(), self.device.display().to_string()];
        argv.extend_from_slice(args);
        let output = self.executor.execute(&self.mtx, argv).await?.into_success()?;
        Ok(output.stdout)
    }
}

#[async_trait]
impl RobotCommandService for MtxRobotCommandService {
    fn device(&self) -> &Path {
        &self.device
    }

    async fn status(&self) -> Result<LibraryStatus> {
        let stdout = self.mtx(&["status".to_string()]).await?;
        parse_library_status(&stdout)
    }

    async fn load(&self, slot: u32, drive: u32) -> Result<()> {
        tracing::info!(device = %self.device.display(), slot, drive, "loading cartridge");
        self.mtx(&["load".to_string(), slot.to_string(), drive.to_string()]).await.map(drop)
    }

    async fn unload(&self, slot: u32, drive: u32) -> Result<()> {
        tracing::info!(device = %self.device.display(), slot, drive, "unloading cartridge");
        self.mtx(&["unload".to_string(), slot.to_string(), drive.to_string()]).await.map(drop)
    }
}
