//! Tape library hardware access.
//!
//! The hardware is driven through three command-line tools: `mt` for drive
//! control, `mtx` for the robot, and `dd` for data transfer. Each concern sits
//! behind a small trait ([`DriveCommandService`], [`RobotCommandService`],
//! [`ReadWriteService`]) with one implementation per tool, and a simulated
//! implementation behind the `simulator` feature.
//!
//! Handles to the physical devices are owned by the [`DevicePool`], which is
//! the only thing allowed to hand them out.

mod drive;
pub mod error;
mod exec;
mod handle;
pub mod parse;
mod pool;
mod readwrite;
mod robot;
#[cfg(feature = "simulator")]
pub mod simulator;

pub use crate::drive::{DriveCommandService, MtDriveCommandService};
pub use crate::exec::{CommandExecutor, CommandOutput};
pub use crate::handle::{DriveHandle, RobotHandle, TapeTarget};
pub use crate::pool::{DevicePool, DriveLease, RobotLease};
pub use crate::readwrite::{DdReadWriteService, ReadWriteService};
pub use crate::robot::{MtxRobotCommandService, RobotCommandService};
