//! Getting the right cartridge into a drive.

use crate::error::{ErrorKind, Result};
use reel_device::parse::TapeLocation;
use reel_device::{DevicePool, DriveHandle};
use std::time::Duration;
use tracing::instrument;

/// Make sure cartridge `label` is loaded in `drive`, and online.
///
/// The drive's own status is checked against the library inventory: a
/// cartridge the robot sees in the drive but the drive reports offline (left
/// ejected by an interrupted swap) is moved out and loaded again. The robot is
/// only checked out when a cartridge has to move, and is given back as soon as
/// it has: it is never held across a data transfer. The caller must hold the
/// drive.
#[instrument("mounting tape", skip(pool, drive, robot_timeout), fields(drive = drive.index()))]
pub async fn ensure_loaded(pool: &DevicePool, drive: &DriveHandle, label: &str, robot_timeout: Duration) -> Result<()> {
    let online = drive.commands().status().await.map_err(ErrorKind::device)?.is_loaded();
    let robot = pool.checkout_robot_timeout(robot_timeout).await.map_err(ErrorKind::device)?;
    let status = robot.commands().status().await.map_err(ErrorKind::device)?;
    let index = drive.index();
    let Some(slot) = status.drive(index) else {
        exn::bail!(ErrorKind::NotFound(format!("drive {index} in library {}", status.device)));
    };
    let loaded = slot.cartridge.as_ref().and_then(|cartridge| cartridge.volume_tag.clone());
    if loaded.as_deref() == Some(label) && online {
        tracing::trace!("tape already loaded");
        return robot.release().map_err(ErrorKind::device);
    }
    if slot.cartridge.is_none() && online {
        exn::bail!(ErrorKind::PreconditionFailed(format!(
            "drive {index} is online but library {} shows it empty",
            status.device
        )));
    }

    let mut source = match status.find_tape(label) {
        Some(TapeLocation::Slot(slot)) => Some(slot),
        Some(TapeLocation::Drive(other)) if other == index => None,
        Some(TapeLocation::Drive(other)) => {
            exn::bail!(ErrorKind::PreconditionFailed(format!("tape {label} is loaded in drive {other}")));
        },
        None => exn::bail!(ErrorKind::NotFound(format!("tape {label} in library {}", status.device))),
    };

    if let Some(current) = loaded.or_else(|| slot.cartridge.as_ref().map(|_| "unlabelled".to_string())) {
        // Send the cartridge back where it came from, if that slot is still free.
        let home = slot.loaded_from.filter(|home| status.is_slot_empty(*home)).or_else(|| status.free_slot());
        let Some(home) = home else {
            exn::bail!(ErrorKind::Internal(format!("no free slot to unload {current} from drive {index}")));
        };
        tracing::info!(tape = %current, slot = home, online, "unloading tape");
        if online {
            drive.commands().eject().await.map_err(ErrorKind::device)?;
        }
        robot.commands().unload(home, index).await.map_err(ErrorKind::device)?;
        source.get_or_insert(home);
    }

    let Some(wanted) = source else {
        exn::bail!(ErrorKind::Internal(format!("tape {label} has nowhere to be loaded from")));
    };
    tracing::info!(tape = label, slot = wanted, "loading tape");
    robot.commands().load(wanted, index).await.map_err(ErrorKind::device)?;
    robot.release().map_err(ErrorKind::device)
}
