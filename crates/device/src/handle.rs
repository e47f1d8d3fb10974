use crate::drive::DriveCommandService;
use crate::error::Result;
use crate::readwrite::ReadWriteService;
use crate::robot::RobotCommandService;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

/// A file on a specific cartridge: the cartridge's volume tag and the tape
/// file number (0 being the first file after the beginning of tape).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TapeTarget {
    pub label: String,
    pub file: u64,
}
impl TapeTarget {
    pub fn new(label: impl Into<String>, file: u64) -> Self {
        Self { label: label.into(), file }
    }
}
impl fmt::Display for TapeTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.label, self.file)
    }
}

/// One physical drive, addressed by the changer's data transfer element index.
///
/// Handles are not `Clone`: the [`DevicePool`](crate::DevicePool) hands each
/// one out to at most one worker at a time.
pub struct DriveHandle {
    index: u32,
    commands: Arc<dyn DriveCommandService>,
    io: Arc<dyn ReadWriteService>,
}
impl DriveHandle {
    pub fn new(index: u32, commands: Arc<dyn DriveCommandService>, io: Arc<dyn ReadWriteService>) -> Self {
        Self { index, commands, io }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn commands(&self) -> &dyn DriveCommandService {
        self.commands.as_ref()
    }

    pub fn io(&self) -> &dyn ReadWriteService {
        self.io.as_ref()
    }

    /// Write `source` as tape file `target.file` of the loaded cartridge.
    ///
    /// The caller is responsible for having loaded `target.label`.
    pub async fn write(&self, source: &Path, target: &TapeTarget) -> Result<u64> {
        tracing::debug!(drive = self.index, %target, "positioning for write");
        self.commands.position(target.file).await?;
        self.io.write_file(source).await
    }

    /// Read tape file `target.file` of the loaded cartridge into `destination`.
    pub async fn read(&self, target: &TapeTarget, destination: &Path) -> Result<u64> {
        tracing::debug!(drive = self.index, %target, "positioning for read");
        self.commands.position(target.file).await?;
        self.io.read_file(destination).await
    }

    pub(crate) fn duplicate(&self) -> Self {
        Self { index: self.index, commands: Arc::clone(&self.commands), io: Arc::clone(&self.io) }
    }
}
impl fmt::Debug for DriveHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriveHandle")
            .field("index", &self.index)
            .field("device", &self.commands.device())
            .finish()
    }
}

/// One robotic loader.
pub struct RobotHandle {
    id: usize,
    commands: Arc<dyn RobotCommandService>,
}
impl RobotHandle {
    pub fn new(commands: Arc<dyn RobotCommandService>) -> Self {
        Self { id: 0, commands }
    }

    /// Position of the robot within its pool.
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn commands(&self) -> &dyn RobotCommandService {
        self.commands.as_ref()
    }

    pub(crate) fn with_id(self, id: usize) -> Self {
        Self { id, ..self }
    }

    pub(crate) fn duplicate(&self) -> Self {
        Self { id: self.id, commands: Arc::clone(&self.commands) }
    }
}
impl fmt::Debug for RobotHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RobotHandle").field("id", &self.id).field("device", &self.commands.device()).finish()
    }
}
