//! In-memory tape library for testing.
//!
//! Models storage slots, drives, and the files written on each cartridge, and
//! implements every device service trait on top of that model, so the whole
//! write/read pipeline can run without hardware. Invalid moves (loading into
//! a full drive, unloading into a full slot, positioning past the end of
//! data) fail the same way the real tools do: with a non-zero exit status.

use crate::drive::DriveCommandService;
use crate::error::{Error, ErrorKind, Result};
use crate::handle::{DriveHandle, RobotHandle};
use crate::parse::{Cartridge, DriveFlag, DriveSlot, DriveStatus, LibraryStatus, StorageSlot};
use crate::pool::DevicePool;
use crate::readwrite::ReadWriteService;
use crate::robot::RobotCommandService;
use async_trait::async_trait;
use exn::ResultExt;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Default)]
struct SimDrive {
    /// Volume tag and the slot it was loaded from.
    loaded: Option<(String, u32)>,
    /// Loaded and threaded. Ejecting leaves the cartridge in the drive but offline.
    online: bool,
    position: u64,
    failing_writes: usize,
    busy_writes: usize,
    writes: usize,
}

#[derive(Default)]
struct State {
    slots: BTreeMap<u32, Option<String>>,
    drives: BTreeMap<u32, SimDrive>,
    tapes: HashMap<String, Vec<Vec<u8>>>,
    robot_moves: usize,
}

/// A simulated library, cheap to clone; clones share the same state.
///
/// ```
/// use reel_device::simulator::SimulatedLibrary;
///
/// let library = SimulatedLibrary::new(2, ["VOL001L6", "VOL002L6"]);
/// let pool = library.pool(1).unwrap();
/// assert_eq!(pool.drive_indices(), [0, 1]);
/// ```
#[derive(Clone, Default)]
pub struct SimulatedLibrary {
    state: Arc<Mutex<State>>,
}

impl SimulatedLibrary {
    /// `drives` empty drives numbered from 0, and one storage slot per tape,
    /// numbered from 1, plus one spare empty slot.
    pub fn new(drives: u32, tapes: impl IntoIterator<Item = impl Into<String>>) -> Self {
        let mut state = State::default();
        let mut slot = 1;
        for tape in tapes {
            let tape = tape.into();
            state.tapes.insert(tape.clone(), Vec::new());
            state.slots.insert(slot, Some(tape));
            slot += 1;
        }
        state.slots.insert(slot, None);
        for index in 0..drives {
            state.drives.insert(index, SimDrive::default());
        }
        Self { state: Arc::new(Mutex::new(state)) }
    }

    /// A pool over this library with `robots` robot handles and every drive.
    pub fn pool(&self, robots: usize) -> Result<DevicePool> {
        let robots = (0..robots).map(|_| RobotHandle::new(Arc::new(self.robot()))).collect();
        let indices: Vec<u32> = self.lock().drives.keys().copied().collect();
        let drives = indices
            .into_iter()
            .map(|index| {
                let drive = Arc::new(self.drive(index));
                DriveHandle::new(index, drive.clone(), drive)
            })
            .collect();
        DevicePool::new(robots, drives)
    }

    pub fn robot(&self) -> SimulatedRobot {
        SimulatedRobot { library: self.clone(), device: PathBuf::from("/dev/sim-changer") }
    }

    pub fn drive(&self, index: u32) -> SimulatedDrive {
        SimulatedDrive { library: self.clone(), index, device: PathBuf::from(format!("/dev/sim-nst{index}")) }
    }

    /// Make the next `count` writes on `drive` fail (after partially writing, like a real failure would).
    pub fn fail_next_writes(&self, drive: u32, count: usize) {
        if let Some(drive) = self.lock().drives.get_mut(&drive) {
            drive.failing_writes = count;
        }
    }

    /// Make the next `count` writes on `drive` fail before touching the tape,
    /// the way a drive still busy with another process refuses to open.
    pub fn busy_next_writes(&self, drive: u32, count: usize) {
        if let Some(drive) = self.lock().drives.get_mut(&drive) {
            drive.busy_writes = count;
        }
    }

    /// Files on a cartridge, in tape order.
    pub fn tape_files(&self, label: &str) -> Vec<Vec<u8>> {
        self.lock().tapes.get(label).cloned().unwrap_or_default()
    }

    /// Volume tag of the cartridge in `drive`, if any.
    pub fn loaded(&self, drive: u32) -> Option<String> {
        self.lock().drives.get(&drive).and_then(|drive| drive.loaded.as_ref().map(|(tag, _)| tag.clone()))
    }

    /// Successful writes performed by `drive`.
    pub fn writes(&self, drive: u32) -> usize {
        self.lock().drives.get(&drive).map_or(0, |drive| drive.writes)
    }

    /// Loads and unloads performed so far.
    pub fn robot_moves(&self) -> usize {
        self.lock().robot_moves
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn failure(program: &str, message: impl Into<String>) -> Error {
    exn::Exn::from(ErrorKind::ExitStatus { program: program.to_string(), code: Some(1), stderr: message.into() })
}

pub struct SimulatedRobot {
    library: SimulatedLibrary,
    device: PathBuf,
}

#[async_trait]
impl RobotCommandService for SimulatedRobot {
    fn device(&self) -> &Path {
        &self.device
    }

    async fn status(&self) -> Result<LibraryStatus> {
        let state = self.library.lock();
        let cartridge = |tag: &String| Cartridge { volume_tag: Some(tag.clone()), alternate_volume_tag: None };
        Ok(LibraryStatus {
            device: self.device.display().to_string(),
            drive_count: state.drives.len() as u32,
            slot_count: state.slots.len() as u32,
            import_export_count: 0,
            drives: state
                .drives
                .iter()
                .map(|(&index, drive)| DriveSlot {
                    index,
                    loaded_from: drive.loaded.as_ref().map(|(_, slot)| *slot),
                    cartridge: drive.loaded.as_ref().map(|(tag, _)| cartridge(tag)),
                })
                .collect(),
            slots: state
                .slots
                .iter()
                .map(|(&index, tape)| StorageSlot { index, import_export: false, cartridge: tape.as_ref().map(cartridge) })
                .collect(),
        })
    }

    async fn load(&self, slot: u32, drive: u32) -> Result<()> {
        let mut state = self.library.lock();
        let state = &mut *state;
        let Some(sim) = state.drives.get_mut(&drive) else {
            return Err(failure("mtx", format!("invalid drive {drive}")));
        };
        if sim.loaded.is_some() {
            return Err(failure("mtx", format!("drive {drive} full")));
        }
        let Some(tape) = state.slots.get_mut(&slot).and_then(Option::take) else {
            return Err(failure("mtx", format!("storage element {slot} empty")));
        };
        sim.loaded = Some((tape, slot));
        sim.online = true;
        sim.position = 0;
        state.robot_moves += 1;
        Ok(())
    }

    async fn unload(&self, slot: u32, drive: u32) -> Result<()> {
        let mut state = self.library.lock();
        let state = &mut *state;
        match state.slots.get(&slot) {
            Some(None) => {},
            Some(Some(_)) => return Err(failure("mtx", format!("storage element {slot} full"))),
            None => return Err(failure("mtx", format!("invalid storage element {slot}"))),
        }
        let Some(sim) = state.drives.get_mut(&drive) else {
            return Err(failure("mtx", format!("invalid drive {drive}")));
        };
        let Some((tape, _)) = sim.loaded.take() else {
            return Err(failure("mtx", format!("drive {drive} empty")));
        };
        sim.online = false;
        state.slots.insert(slot, Some(tape));
        state.robot_moves += 1;
        Ok(())
    }
}

pub struct SimulatedDrive {
    library: SimulatedLibrary,
    index: u32,
    device: PathBuf,
}
impl SimulatedDrive {
    /// The drive and the volume tag of its loaded cartridge.
    fn mounted<'a>(&self, state: &'a mut State, program: &str) -> Result<(&'a mut SimDrive, String)> {
        let sim = state.drives.get_mut(&self.index).ok_or_else(|| failure(program, "no such device"))?;
        let tape = sim.loaded.as_ref().map(|(tag, _)| tag.clone()).ok_or_else(|| failure(program, "no medium"))?;
        if !sim.online {
            return Err(failure(program, format!("{}: Input/output error: medium not loaded", self.device.display())));
        }
        Ok((sim, tape))
    }
}

#[async_trait]
impl DriveCommandService for SimulatedDrive {
    fn device(&self) -> &Path {
        &self.device
    }

    async fn status(&self) -> Result<DriveStatus> {
        let state = self.library.lock();
        let sim = state.drives.get(&self.index).ok_or_else(|| failure("mt", "no such device"))?;
        let mut status = DriveStatus { description: Some("Simulated tape drive".to_string()), ..Default::default() };
        match &sim.loaded {
            Some(_) if sim.online => {
                status.file_number = Some(sim.position as i64);
                status.block_number = Some(0);
                status.flags = BTreeSet::from([DriveFlag::Online, DriveFlag::ImmediateReport]);
                if sim.position == 0 {
                    status.flags.insert(DriveFlag::Bot);
                }
            },
            _ => {
                status.file_number = Some(-1);
                status.flags = BTreeSet::from([DriveFlag::DoorOpen, DriveFlag::ImmediateReport]);
            },
        }
        Ok(status)
    }

    async fn rewind(&self) -> Result<()> {
        self.position(0).await
    }

    async fn eject(&self) -> Result<()> {
        let mut state = self.library.lock();
        let (sim, _) = self.mounted(&mut state, "mt")?;
        sim.position = 0;
        sim.online = false;
        Ok(())
    }

    async fn position(&self, file: u64) -> Result<()> {
        let mut state = self.library.lock();
        let (_, tape) = self.mounted(&mut state, "mt")?;
        let files = state.tapes.get(&tape).map_or(0, Vec::len) as u64;
        if file > files {
            return Err(failure("mt", format!("cannot space to file {file}: end of data at {files}")));
        }
        let (sim, _) = self.mounted(&mut state, "mt")?;
        sim.position = file;
        Ok(())
    }
}

#[async_trait]
impl ReadWriteService for SimulatedDrive {
    async fn write_file(&self, source: &Path) -> Result<u64> {
        let data = tokio::fs::read(source).await.or_raise(|| ErrorKind::Io)?;
        let mut state = self.library.lock();
        let (sim, tape) = self.mounted(&mut state, "dd")?;
        if sim.busy_writes > 0 {
            sim.busy_writes -= 1;
            return Err(failure("dd", format!("dd: failed to open '{}': Device or resource busy", self.device.display())));
        }
        let position = sim.position as usize;
        let failing = sim.failing_writes > 0;
        if failing {
            sim.failing_writes -= 1;
        } else {
            sim.position += 1;
            sim.writes += 1;
        }
        let files = state.tapes.entry(tape).or_default();
        // Writing anywhere erases everything after it, like a real tape.
        files.truncate(position);
        if failing {
            // Half a file and no trailing file mark.
            files.push(data[..data.len() / 2].to_vec());
            return Err(failure("dd", "error writing: Input/output error"));
        }
        let written = data.len() as u64;
        files.push(data);
        Ok(written)
    }

    async fn read_file(&self, destination: &Path) -> Result<u64> {
        let data = {
            let mut state = self.library.lock();
            let (sim, tape) = self.mounted(&mut state, "dd")?;
            let position = sim.position as usize;
            sim.position += 1;
            match state.tapes.get(&tape).and_then(|files| files.get(position)) {
                Some(data) => data.clone(),
                None => return Err(failure("dd", "error reading: end of data")),
            }
        };
        tokio::fs::write(destination, &data).await.or_raise(|| ErrorKind::Io)?;
        Ok(data.len() as u64)
    }
}
