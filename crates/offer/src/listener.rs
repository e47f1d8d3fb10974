//! Write-order listener: drains one bucket's queue onto tape.
//!
//! For each order, in sequence order:
//! 1. check out the bucket's drive, waiting for as long as someone else holds
//!    it (waiting is not a failed attempt),
//! 2. pick the bucket's first writable tape and mount it (the robot is only
//!    held while cartridges move),
//! 3. position after the tape's last file and transfer the container,
//! 4. record the write in the tape catalog and move the container
//!    `READY_ON_DISK → ON_TAPE` (compare-and-swap),
//! 5. only then acknowledge the order, and purge the local copy.
//!
//! Any failure before step 5 leaves the order unacknowledged, so it is
//! delivered again. A redelivered order whose container is already on tape
//! is simply acknowledged. A transient write failure (drive busy or settling)
//! is retried on the same tape; any other write failure sets the tape aside.

use crate::error::{ErrorKind, Result};
use crate::mount;
use reel_archive::Container;
use reel_config::{BucketConfig, ListenerConfig};
use reel_device::error::ErrorKind as DeviceErrorKind;
use reel_device::{DevicePool, DriveLease, TapeTarget};
use reel_referential::{
    ContainerRepository, ContainerState, StateChange, TapeAddress, TapeCatalog, TapeState, WriteOrder, WriteOrderQueue,
};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

// Delays stop doubling after this many failures.
const MAX_BACKOFF_DOUBLINGS: u32 = 5;

/// Delay before the next attempt, doubling with every failed attempt so far.
pub(crate) fn backoff(base: Duration, attempts: u32) -> Duration {
    base.saturating_mul(1 << attempts.saturating_sub(1).min(MAX_BACKOFF_DOUBLINGS))
}

/// What a delivered order amounted to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Written(TapeAddress),
    /// An earlier delivery had already put the container on tape.
    AlreadyOnTape,
}

#[derive(Debug, Clone)]
pub struct ListenerSettings {
    pub listener: ListenerConfig,
    pub full_cartridge_threshold: u64,
    pub purge_after_write: bool,
}

#[derive(Clone)]
pub struct Listener {
    bucket: String,
    topology: BucketConfig,
    settings: ListenerSettings,
    pool: DevicePool,
    queue: WriteOrderQueue,
    containers: ContainerRepository,
    catalog: TapeCatalog,
    shutdown: CancellationToken,
}

impl Listener {
    pub fn new(
        bucket: impl Into<String>,
        topology: BucketConfig,
        settings: ListenerSettings,
        pool: DevicePool,
        queue: WriteOrderQueue,
        containers: ContainerRepository,
        catalog: TapeCatalog,
        shutdown: CancellationToken,
    ) -> Self {
        Self { bucket: bucket.into(), topology, settings, pool, queue, containers, catalog, shutdown }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Process orders until shutdown.
    pub async fn run(self) {
        tracing::info!(bucket = %self.bucket, drive = self.topology.drive, "listener started");
        let wait = self.settings.listener.poll_wait();
        while !self.shutdown.is_cancelled() {
            let polled = tokio::select! {
                () = self.shutdown.cancelled() => break,
                polled = self.queue.poll(&self.bucket, wait) => polled,
            };
            match polled.map_err(ErrorKind::referential) {
                Ok(Some(order)) => self.process(order).await,
                Ok(None) => {},
                Err(err) if matches!(&*err, ErrorKind::ShuttingDown) => break,
                Err(err) => {
                    tracing::error!(bucket = %self.bucket, error = ?err, "could not poll write-order queue");
                    self.pause(self.settings.listener.retry_backoff()).await;
                },
            }
        }
        tracing::info!(bucket = %self.bucket, "listener stopped");
    }

    /// Deliver one order and settle it: acknowledge, retry later, or park.
    #[instrument("processing write order", skip(self, order), fields(bucket = %self.bucket, container = %order.container_id, sequence = order.sequence))]
    pub async fn process(&self, order: WriteOrder) {
        let attempts = match self.queue.record_attempt(order.id).await {
            Ok(attempts) => attempts,
            Err(err) => {
                tracing::error!(error = ?err, "could not record delivery attempt");
                return self.pause(self.settings.listener.retry_backoff()).await;
            },
        };
        match self.deliver(&order).await {
            Ok(delivery) => self.settle(&order, delivery).await,
            Err(err) if matches!(&*err, ErrorKind::ShuttingDown) => {
                tracing::info!("delivery interrupted by shutdown, order stays queued");
            },
            Err(err) if err.is_retryable() && attempts < self.settings.listener.max_attempts => {
                let delay = backoff(self.settings.listener.retry_backoff(), attempts);
                tracing::warn!(attempts, ?delay, error = ?err, "write order failed, will retry");
                self.pause(delay).await;
            },
            Err(err) => {
                tracing::error!(alert = true, attempts, error = ?err, "write order failed, parking it for an operator");
                if let Err(err) = self.queue.park(order.id).await {
                    tracing::error!(error = ?err, "could not park write order");
                }
            },
        }
    }

    async fn settle(&self, order: &WriteOrder, delivery: Delivery) {
        match self.queue.acknowledge(order.id).await {
            Ok(true) => {},
            Ok(false) => tracing::debug!("write order was already acknowledged"),
            // Unacknowledged: it'll be delivered again and found on tape.
            Err(err) => return tracing::error!(error = ?err, "could not acknowledge write order"),
        }
        match &delivery {
            Delivery::Written(address) => tracing::info!(tape = %address, "container written to tape"),
            Delivery::AlreadyOnTape => tracing::info!("container already on tape"),
        }
        if self.settings.purge_after_write {
            match tokio::fs::remove_file(&order.source_path).await {
                Ok(()) => tracing::debug!(path = %order.source_path.display(), "local container purged"),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {},
                Err(err) => tracing::warn!(path = %order.source_path.display(), error = %err, "could not purge local container"),
            }
        }
    }

    /// Put the order's container on tape, or find that it already is.
    pub async fn deliver(&self, order: &WriteOrder) -> Result<Delivery> {
        let Some(entry) = self.containers.find(&order.container_id).await.map_err(ErrorKind::referential)? else {
            exn::bail!(ErrorKind::NotFound(format!("container {}", order.container_id)));
        };
        match entry.state {
            ContainerState::OnTape => return Ok(Delivery::AlreadyOnTape),
            ContainerState::BuildingOnDisk => {
                exn::bail!(ErrorKind::Internal(format!("container {} is queued but not sealed", entry.id)))
            },
            ContainerState::ReadyOnDisk => {},
        }
        let Some(container) = entry.container() else {
            exn::bail!(ErrorKind::Internal(format!("container {} is ready without a digest", entry.id)));
        };
        // Never put anything on tape that doesn't match what was sealed.
        verify(&container).await?;

        let drive = self.checkout_drive().await?;
        loop {
            let Some(tape) =
                self.catalog.select_writable(&self.bucket, &self.topology.tapes).await.map_err(ErrorKind::referential)?
            else {
                exn::bail!(ErrorKind::NoWritableTape(self.bucket.clone()));
            };
            mount::ensure_loaded(&self.pool, &drive, &tape.label, self.settings.listener.robot_checkout_timeout())
                .await?;
            let target = TapeTarget::new(tape.label.clone(), tape.file_count);
            tracing::info!(%target, size = container.size, "writing container to tape");
            let written = match drive.write(&container.path, &target).await {
                Ok(written) => written,
                Err(err) => {
                    let err = ErrorKind::device(err);
                    if matches!(&*err, ErrorKind::ShuttingDown) {
                        // Whatever got written past the last file mark is overwritten next time.
                        return Err(err);
                    }
                    if err.is_retryable() {
                        // The tape stays writable; the retry writes at the same position.
                        tracing::warn!(tape = %tape.label, error = ?err, "drive not ready for writing");
                        return Err(err);
                    }
                    if tape.written_bytes.saturating_add(container.size) >= self.settings.full_cartridge_threshold {
                        tracing::warn!(tape = %tape.label, written = tape.written_bytes, error = ?err, "write failed near capacity, tape is full");
                        self.catalog.set_state(&tape.label, TapeState::Full).await.map_err(ErrorKind::referential)?;
                        continue;
                    }
                    tracing::error!(alert = true, tape = %tape.label, error = ?err, "write failed, setting tape aside");
                    self.catalog.set_state(&tape.label, TapeState::Conflict).await.map_err(ErrorKind::referential)?;
                    return Err(err.raise(ErrorKind::TapeRejected(tape.label)));
                },
            };
            self.catalog
                .record_write(&tape.label, tape.file_count, written)
                .await
                .map_err(ErrorKind::referential)?;
            let address = TapeAddress { label: tape.label, file: tape.file_count };
            let change = StateChange::Written(address.clone());
            return match self.containers.update_state(&container.id, ContainerState::ReadyOnDisk, &change).await {
                Ok(()) => Ok(Delivery::Written(address)),
                Err(err) => {
                    let err = ErrorKind::referential(err);
                    if !matches!(&*err, ErrorKind::PreconditionFailed(_)) {
                        return Err(err);
                    }
                    // Lost the race to an earlier delivery: the copy just written is a harmless duplicate.
                    tracing::info!(error = ?err, "container was put on tape by an earlier delivery");
                    Ok(Delivery::AlreadyOnTape)
                },
            };
        }
    }

    /// Wait for the bucket's drive until it is free or the service shuts down.
    async fn checkout_drive(&self) -> Result<DriveLease> {
        let index = self.topology.drive;
        let wait = self.settings.listener.robot_checkout_timeout();
        loop {
            let checkout = tokio::select! {
                () = self.shutdown.cancelled() => exn::bail!(ErrorKind::ShuttingDown),
                checkout = self.pool.checkout_drive_timeout(index, wait) => checkout,
            };
            match checkout {
                Ok(drive) => return Ok(drive),
                Err(err) if matches!(&*err, DeviceErrorKind::PoolExhausted(_)) => {
                    tracing::info!(drive = index, waited = ?wait, "drive still in use, waiting for it");
                },
                Err(err) => return Err(ErrorKind::device(err)),
            }
        }
    }

    async fn pause(&self, delay: Duration) {
        tokio::select! {
            () = self.shutdown.cancelled() => {},
            () = tokio::time::sleep(delay) => {},
        }
    }
}

async fn verify(container: &Container) -> Result<()> {
    let path = container.path.clone();
    let digest = container.digest.clone();
    tokio::task::spawn_blocking(move || reel_archive::verify(&path, &digest))
        .await
        .map_err(|err| ErrorKind::Internal(err.to_string()))?
        .map_err(ErrorKind::archive)?;
    Ok(())
}
