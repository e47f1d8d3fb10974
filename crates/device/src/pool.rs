//! Device Pool: exclusive checkout of robots and drives.
//!
//! Robots are interchangeable, so they sit in a FIFO queue guarded by a fair
//! semaphore: [`DevicePool::checkout_robot`] blocks until one is free, in
//! arrival order. Drives are *not* interchangeable (each one has its own
//! cabling and its own loaded cartridge), so they're looked up by index and
//! [`DevicePool::checkout_drive`] never blocks: a drive that is in use is
//! simply reported as absent.
//!
//! Checkouts are handed out as leases that give the handle back when dropped,
//! so every exit path (including errors and panics) returns the handle.

use crate::drive::MtDriveCommandService;
use crate::error::{ErrorKind, Result};
use crate::exec::CommandExecutor;
use crate::handle::{DriveHandle, RobotHandle};
use crate::readwrite::DdReadWriteService;
use crate::robot::MtxRobotCommandService;
use exn::ResultExt;
use reel_config::{LibraryConfig, ToolsConfig};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{Notify, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

struct RobotState {
    idle: VecDeque<RobotHandle>,
    checked_out: HashSet<usize>,
}

struct Shared {
    robots: Mutex<RobotState>,
    // Invariant: available permits == robots.idle.len() (until closed).
    robot_permits: Semaphore,
    robot_count: usize,
    drives: Mutex<BTreeMap<u32, Option<DriveHandle>>>,
    drive_returned: Notify,
    closed: AtomicBool,
}

#[derive(Clone)]
pub struct DevicePool {
    shared: Arc<Shared>,
}

impl DevicePool {
    pub fn new(robots: Vec<RobotHandle>, drives: Vec<DriveHandle>) -> Result<Self> {
        let mut slots = BTreeMap::new();
        for drive in drives {
            let index = drive.index();
            if slots.insert(index, Some(drive)).is_some() {
                exn::bail!(ErrorKind::DuplicateDrive(index));
            }
        }
        let robot_count = robots.len();
        let idle = robots.into_iter().enumerate().map(|(id, robot)| robot.with_id(id)).collect();
        Ok(Self {
            shared: Arc::new(Shared {
                robots: Mutex::new(RobotState { idle, checked_out: HashSet::new() }),
                robot_permits: Semaphore::new(robot_count),
                robot_count,
                drives: Mutex::new(slots),
                drive_returned: Notify::new(),
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Build the pool for the configured library, talking to the hardware through `mt`, `mtx` and `dd`.
    ///
    /// Every subprocess is tied to `shutdown`: once it is cancelled, running
    /// commands get the configured grace period before being killed.
    pub fn from_config(tools: &ToolsConfig, library: &LibraryConfig, shutdown: CancellationToken) -> Result<Self> {
        let commands = CommandExecutor::new(tools.command_timeout(), tools.shutdown_grace(), shutdown);
        let transfers = commands.with_timeout(tools.transfer_timeout());
        let robots = library
            .robots
            .iter()
            .map(|device| RobotHandle::new(Arc::new(MtxRobotCommandService::new(&tools.mtx, device, commands.clone()))))
            .collect();
        let drives = library
            .drives
            .iter()
            .map(|drive| {
                DriveHandle::new(
                    drive.index,
                    Arc::new(MtDriveCommandService::new(&tools.mt, &drive.device, commands.clone())),
                    Arc::new(DdReadWriteService::new(&tools.dd, &drive.device, tools.block_size, transfers.clone())),
                )
            })
            .collect();
        Self::new(robots, drives)
    }

    pub fn robot_count(&self) -> usize {
        self.shared.robot_count
    }

    pub fn available_robots(&self) -> usize {
        self.shared.robot_permits.available_permits()
    }

    pub fn drive_indices(&self) -> Vec<u32> {
        lock(&self.shared.drives).keys().copied().collect()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Wait, in FIFO order with other callers, until a robot is free.
    pub async fn checkout_robot(&self) -> Result<RobotLease> {
        if self.is_closed() {
            exn::bail!(ErrorKind::ShuttingDown);
        }
        let permit = self.shared.robot_permits.acquire().await.or_raise(|| ErrorKind::ShuttingDown)?;
        // The permit now stands for the handle itself; it comes back via `return_robot`.
        permit.forget();
        let handle = {
            let mut robots = lock(&self.shared.robots);
            let handle = robots.idle.pop_front();
            if let Some(handle) = &handle {
                robots.checked_out.insert(handle.id());
            }
            handle
        };
        match handle {
            Some(handle) => {
                tracing::trace!(robot = handle.id(), "robot checked out");
                Ok(RobotLease { pool: self.clone(), handle, returned: false })
            },
            None => exn::bail!(ErrorKind::PoolExhausted("robot")),
        }
    }

    /// Like [`checkout_robot`](Self::checkout_robot), giving up after `timeout`
    /// with [`ErrorKind::PoolExhausted`]. The pool never retries on its own.
    pub async fn checkout_robot_timeout(&self, timeout: Duration) -> Result<RobotLease> {
        match tokio::time::timeout(timeout, self.checkout_robot()).await {
            Ok(lease) => lease,
            Err(_) => exn::bail!(ErrorKind::PoolExhausted("robot")),
        }
    }

    /// Take drive `index` if it is free; `None` if another worker holds it.
    pub fn checkout_drive(&self, index: u32) -> Result<Option<DriveLease>> {
        if self.is_closed() {
            exn::bail!(ErrorKind::ShuttingDown);
        }
        let mut drives = lock(&self.shared.drives);
        let Some(slot) = drives.get_mut(&index) else {
            exn::bail!(ErrorKind::UnknownDrive(index));
        };
        Ok(slot.take().map(|handle| {
            tracing::trace!(drive = index, "drive checked out");
            DriveLease { pool: self.clone(), handle, returned: false }
        }))
    }

    /// Wait up to `timeout` for drive `index` to be returned by whoever holds it.
    pub async fn checkout_drive_timeout(&self, index: u32, timeout: Duration) -> Result<DriveLease> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.shared.drive_returned.notified();
            tokio::pin!(notified);
            // Register before checking, so a return in between isn't missed.
            notified.as_mut().enable();
            if let Some(lease) = self.checkout_drive(index)? {
                return Ok(lease);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                exn::bail!(ErrorKind::PoolExhausted("drive"));
            }
        }
    }

    pub fn return_robot(&self, handle: RobotHandle) -> Result<()> {
        let id = handle.id();
        {
            let mut robots = lock(&self.shared.robots);
            if !robots.checked_out.remove(&id) {
                exn::bail!(ErrorKind::NotCheckedOut(format!("robot {id}")));
            }
            robots.idle.push_back(handle);
        }
        self.shared.robot_permits.add_permits(1);
        tracing::trace!(robot = id, "robot returned");
        Ok(())
    }

    pub fn return_drive(&self, handle: DriveHandle) -> Result<()> {
        let index = handle.index();
        {
            let mut drives = lock(&self.shared.drives);
            match drives.get_mut(&index) {
                Some(slot @ None) => *slot = Some(handle),
                Some(Some(_)) => exn::bail!(ErrorKind::NotCheckedOut(format!("drive {index}"))),
                None => exn::bail!(ErrorKind::UnknownDrive(index)),
            }
        }
        self.shared.drive_returned.notify_waiters();
        tracing::trace!(drive = index, "drive returned");
        Ok(())
    }

    /// Stop handing out handles. Blocked checkouts fail with [`ErrorKind::ShuttingDown`];
    /// handles already out can still be returned.
    pub fn close(&self) {
        if !self.shared.closed.swap(true, Ordering::AcqRel) {
            tracing::debug!("device pool closed to new checkouts");
        }
        self.shared.robot_permits.close();
        self.shared.drive_returned.notify_waiters();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // Nothing inside the critical sections can leave the state half-updated.
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A checked-out robot; returned to the pool when dropped.
#[must_use = "the robot is returned to the pool as soon as the lease is dropped"]
pub struct RobotLease {
    pool: DevicePool,
    handle: RobotHandle,
    returned: bool,
}
impl RobotLease {
    /// Return the robot now, reporting a failed return instead of logging it.
    pub fn release(mut self) -> Result<()> {
        self.returned = true;
        self.pool.return_robot(self.handle.duplicate())
    }

    /// Detach the handle; the caller must give it back with [`DevicePool::return_robot`].
    pub fn into_handle(mut self) -> RobotHandle {
        self.returned = true;
        self.handle.duplicate()
    }
}
impl Deref for RobotLease {
    type Target = RobotHandle;
    fn deref(&self) -> &Self::Target {
        &self.handle
    }
}
impl Drop for RobotLease {
    fn drop(&mut self) {
        if !self.returned
            && let Err(err) = self.pool.return_robot(self.handle.duplicate())
        {
            tracing::error!(error = ?err, "could not return robot to the pool");
        }
    }
}

/// A checked-out drive; returned to the pool when dropped.
#[must_use = "the drive is returned to the pool as soon as the lease is dropped"]
pub struct DriveLease {
    pool: DevicePool,
    handle: DriveHandle,
    returned: bool,
}
impl std::fmt::Debug for DriveLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriveLease").field("handle", &self.handle).field("returned", &self.returned).finish_non_exhaustive()
    }
}
impl DriveLease {
    pub fn release(mut self) -> Result<()> {
        self.returned = true;
        self.pool.return_drive(self.handle.duplicate())
    }

    /// Detach the handle; the caller must give it back with [`DevicePool::return_drive`].
    pub fn into_handle(mut self) -> DriveHandle {
        self.returned = true;
        self.handle.duplicate()
    }
}
impl Deref for DriveLease {
    type Target = DriveHandle;
    fn deref(&self) -> &Self::Target {
        &self.handle
    }
}
impl Drop for DriveLease {
    fn drop(&mut self) {
        if !self.returned
            && let Err(err) = self.pool.return_drive(self.handle.duplicate())
        {
            tracing::error!(error = ?err, "could not return drive to the pool");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drive::DriveCommandService;
    use crate::parse::{DriveStatus, LibraryStatus};
    use crate::readwrite::ReadWriteService;
    use crate::robot::RobotCommandService;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::atomic::AtomicUsize;

    struct Idle;

    #[async_trait]
    impl RobotCommandService for Idle {
        fn device(&self) -> &Path {
            Path::new("/dev/null")
        }
        async fn status(&self) -> Result<LibraryStatus> {
            Ok(LibraryStatus::default())
        }
        async fn load(&self, _: u32, _: u32) -> Result<()> {
            Ok(())
        }
        async fn unload(&self, _: u32, _: u32) -> Result<()> {
            Ok(())
        }
    }

    #[async_trait]
    impl DriveCommandService for Idle {
        fn device(&self) -> &Path {
            Path::new("/dev/null")
        }
        async fn status(&self) -> Result<DriveStatus> {
            Ok(DriveStatus::default())
        }
        async fn rewind(&self) -> Result<()> {
            Ok(())
        }
        async fn eject(&self) -> Result<()> {
            Ok(())
        }
        async fn position(&self, _: u64) -> Result<()> {
            Ok(())
        }
    }

    #[async_trait]
    impl ReadWriteService for Idle {
        async fn write_file(&self, _: &Path) -> Result<u64> {
            Ok(0)
        }
        async fn read_file(&self, _: &Path) -> Result<u64> {
            Ok(0)
        }
    }

    fn pool(robots: usize, drives: &[u32]) -> DevicePool {
        let robots = (0..robots).map(|_| RobotHandle::new(Arc::new(Idle))).collect();
        let drives = drives.iter().map(|&index| DriveHandle::new(index, Arc::new(Idle), Arc::new(Idle))).collect();
        DevicePool::new(robots, drives).unwrap()
    }

    #[tokio::test]
    async fn test_checkout_drive_is_keyed_and_non_blocking() {
        let pool = pool(1, &[1, 2]);
        let lease = pool.checkout_drive(2).unwrap().expect("drive 2 should be free");
        assert_eq!(lease.index(), 2);
        // Already out: absent immediately, while the other drive is unaffected.
        assert!(pool.checkout_drive(2).unwrap().is_none());
        assert!(pool.checkout_drive(1).unwrap().is_some());
        drop(lease);
        assert!(pool.checkout_drive(2).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_unknown_drive() {
        let err = pool(1, &[0]).checkout_drive(7).unwrap_err();
        assert!(matches!(&*err, ErrorKind::UnknownDrive(7)));
    }

    #[test]
    fn test_duplicate_drive_index() {
        let drives = vec![
            DriveHandle::new(0, Arc::new(Idle), Arc::new(Idle)),
            DriveHandle::new(0, Arc::new(Idle), Arc::new(Idle)),
        ];
        let err = DevicePool::new(Vec::new(), drives).err().unwrap();
        assert!(matches!(&*err, ErrorKind::DuplicateDrive(0)));
    }

    #[tokio::test]
    async fn test_checkout_robot_blocks_until_returned() {
        let pool = pool(1, &[]);
        let lease = pool.checkout_robot().await.unwrap();
        let waiter = tokio::spawn({
            let pool = pool.clone();
            async move { pool.checkout_robot().await.map(|lease| lease.id()) }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());
        lease.release().unwrap();
        assert_eq!(waiter.await.unwrap().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_checkout_robot_timeout() {
        let pool = pool(1, &[]);
        let _held = pool.checkout_robot().await.unwrap();
        let err = pool.checkout_robot_timeout(Duration::from_millis(20)).await.err().unwrap();
        assert!(matches!(&*err, ErrorKind::PoolExhausted("robot")));
        assert!(err.is_retryable());
        // The timed-out waiter must not have swallowed a permit.
        assert_eq!(pool.available_robots(), 0);
        drop(_held);
        assert_eq!(pool.available_robots(), 1);
    }

    #[tokio::test]
    async fn test_robot_waiters_are_served_in_order() {
        let pool = pool(1, &[]);
        let held = pool.checkout_robot().await.unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut waiters = Vec::new();
        for n in 0..3 {
            let (pool, tx) = (pool.clone(), tx.clone());
            waiters.push(tokio::spawn(async move {
                let lease = pool.checkout_robot().await.unwrap();
                tx.send(n).unwrap();
                tokio::time::sleep(Duration::from_millis(5)).await;
                drop(lease);
            }));
            // Make arrival order deterministic.
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        drop(held);
        for waiter in waiters {
            waiter.await.unwrap();
        }
        let order: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert_eq!(order, [0, 1, 2]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_checkouts_are_exclusive() {
        const ROBOTS: usize = 2;
        let pool = pool(ROBOTS, &[0, 1, 2]);
        let robots_out = Arc::new(AtomicUsize::new(0));
        let drives_out = Arc::new(Mutex::new(HashSet::new()));
        let mut workers = Vec::new();
        for worker in 0..16u32 {
            let (pool, robots_out, drives_out) = (pool.clone(), robots_out.clone(), drives_out.clone());
            workers.push(tokio::spawn(async move {
                for round in 0..50u32 {
                    let robot = pool.checkout_robot().await.unwrap();
                    assert!(robots_out.fetch_add(1, Ordering::SeqCst) < ROBOTS);
                    if let Some(drive) = pool.checkout_drive((worker + round) % 3).unwrap() {
                        assert!(drives_out.lock().unwrap().insert(drive.index()), "drive handed out twice");
                        tokio::task::yield_now().await;
                        drives_out.lock().unwrap().remove(&drive.index());
                    }
                    tokio::task::yield_now().await;
                    robots_out.fetch_sub(1, Ordering::SeqCst);
                    drop(robot);
                }
            }));
        }
        for worker in workers {
            worker.await.unwrap();
        }
        assert_eq!(pool.available_robots(), ROBOTS);
        assert_eq!(pool.drive_indices(), [0, 1, 2]);
        for index in 0..3 {
            assert!(pool.checkout_drive(index).unwrap().is_some());
        }
    }

    #[tokio::test]
    async fn test_returning_twice_is_rejected() {
        let pool = pool(1, &[0]);
        let robot = pool.checkout_robot().await.unwrap().into_handle();
        let copy = robot.duplicate();
        pool.return_robot(robot).unwrap();
        let err = pool.return_robot(copy).unwrap_err();
        assert!(matches!(&*err, ErrorKind::NotCheckedOut(_)));
        assert_eq!(pool.available_robots(), 1);

        let drive = pool.checkout_drive(0).unwrap().unwrap().into_handle();
        let copy = drive.duplicate();
        pool.return_drive(drive).unwrap();
        let err = pool.return_drive(copy).unwrap_err();
        assert!(matches!(&*err, ErrorKind::NotCheckedOut(_)));
    }

    #[tokio::test]
    async fn test_close_wakes_waiters() {
        let pool = pool(1, &[0]);
        let _robot = pool.checkout_robot().await.unwrap();
        let _drive = pool.checkout_drive(0).unwrap().unwrap();
        let robot_waiter = tokio::spawn({
            let pool = pool.clone();
            async move { pool.checkout_robot().await.err() }
        });
        let drive_waiter = tokio::spawn({
            let pool = pool.clone();
            async move { pool.checkout_drive_timeout(0, Duration::from_secs(30)).await.err() }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        pool.close();
        let err = robot_waiter.await.unwrap().unwrap();
        assert!(matches!(&*err, ErrorKind::ShuttingDown));
        let err = drive_waiter.await.unwrap().unwrap();
        assert!(matches!(&*err, ErrorKind::ShuttingDown));
        assert!(matches!(&*pool.checkout_drive(0).err().unwrap(), ErrorKind::ShuttingDown));
    }

    #[tokio::test]
    async fn test_checkout_drive_timeout_waits_for_return() {
        let pool = pool(0, &[3]);
        let lease = pool.checkout_drive(3).unwrap().unwrap();
        let waiter = tokio::spawn({
            let pool = pool.clone();
            async move { pool.checkout_drive_timeout(3, Duration::from_secs(5)).await.map(|lease| lease.index()) }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(lease);
        assert_eq!(waiter.await.unwrap().unwrap(), 3);
    }
}
