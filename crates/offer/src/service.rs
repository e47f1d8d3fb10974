//! Service lifecycle: wiring the components together, background workers, and shutdown.

use crate::creator::WriteOrderCreator;
use crate::error::{ErrorKind, Result};
use crate::listener::{Listener, ListenerSettings};
use crate::storage::BackupFileStorage;
use crate::sweep::{RecoverySweep, SweepReport};
use exn::ResultExt;
use reel_config::Config;
use reel_device::DevicePool;
use reel_device::parse::{DriveStatus, LibraryStatus};
use reel_referential::{ContainerRepository, Database, TapeCatalog, WriteOrderQueue};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

/// The tape storage offer: storage façade, write-order listeners and recovery sweep.
pub struct TapeOffer {
    config: Config,
    db: Database,
    pool: DevicePool,
    queue: WriteOrderQueue,
    containers: ContainerRepository,
    catalog: TapeCatalog,
    storage: BackupFileStorage,
    sweep: RecoverySweep,
    shutdown: CancellationToken,
    workers: Vec<JoinHandle<()>>,
}

impl TapeOffer {
    /// Open the database and the configured library, without starting any
    /// background work. Enough for one-off commands.
    pub async fn open(config: Config) -> Result<Self> {
        config.validate().or_raise(|| ErrorKind::Config)?;
        let tools = match config.tools.resolved() {
            Ok(tools) => tools,
            Err(err) => {
                tracing::warn!(error = ?err, "external tool not found, device commands will fail");
                config.tools.clone()
            },
        };
        let shutdown = CancellationToken::new();
        let pool = DevicePool::from_config(&tools, &config.library, shutdown.clone()).map_err(ErrorKind::device)?;
        let db = Database::connect(&config.storage.database).await.map_err(ErrorKind::referential)?;
        Self::open_with(config, db, pool, shutdown).await
    }

    /// Like [`open`](Self::open), over an existing database and device pool.
    /// `shutdown` must be the token the pool's commands are tied to.
    pub async fn open_with(config: Config, db: Database, pool: DevicePool, shutdown: CancellationToken) -> Result<Self> {
        config.validate().or_raise(|| ErrorKind::Config)?;
        let containers = ContainerRepository::from(&db);
        let queue = WriteOrderQueue::from(&db);
        let catalog = TapeCatalog::from(&db);
        let creator = WriteOrderCreator::new(containers.clone(), queue.clone());
        let sweep = RecoverySweep::new(containers.clone(), creator.clone(), &config.storage.input_dir);
        let storage = BackupFileStorage::new(&config, containers.clone(), creator, pool.clone());
        storage.cache().load().await?;
        for (bucket, topology) in &config.buckets {
            for label in &topology.tapes {
                catalog.register(label, bucket).await.map_err(ErrorKind::referential)?;
            }
        }
        Ok(Self { config, db, pool, queue, containers, catalog, storage, sweep, shutdown, workers: Vec::new() })
    }

    /// Open, recover, and start one listener per bucket plus the periodic sweep.
    pub async fn start(config: Config) -> Result<Self> {
        // Serving without the hardware tools makes no sense.
        config.tools.resolved().or_raise(|| ErrorKind::Config)?;
        let mut offer = Self::open(config).await?;
        offer.recover().await?;
        offer.spawn_workers();
        Ok(offer)
    }

    /// Like [`start`](Self::start), over an existing database and device pool.
    pub async fn start_with(config: Config, db: Database, pool: DevicePool, shutdown: CancellationToken) -> Result<Self> {
        let mut offer = Self::open_with(config, db, pool, shutdown).await?;
        offer.recover().await?;
        offer.spawn_workers();
        Ok(offer)
    }

    /// Seal or discard containers a previous process left half-built, remove
    /// files without a record, then requeue stranded containers.
    #[instrument("recovering", skip(self))]
    pub async fn recover(&self) -> Result<SweepReport> {
        let bootstrap = self.sweep.bootstrap().await?;
        if !bootstrap.is_empty() {
            tracing::warn!(
                sealed = bootstrap.sealed.len(),
                discarded = bootstrap.discarded.len(),
                orphans = bootstrap.orphans.len(),
                "repaired what a previous run left behind"
            );
        }
        self.sweep.run().await
    }

    fn spawn_workers(&mut self) {
        let settings = ListenerSettings {
            listener: self.config.listener.clone(),
            full_cartridge_threshold: self.config.library.full_cartridge_threshold,
            purge_after_write: self.config.storage.purge_after_write,
        };
        for (bucket, topology) in &self.config.buckets {
            let listener = Listener::new(
                bucket.clone(),
                topology.clone(),
                settings.clone(),
                self.pool.clone(),
                self.queue.clone(),
                self.containers.clone(),
                self.catalog.clone(),
                self.shutdown.clone(),
            );
            self.workers.push(tokio::spawn(listener.run()));
        }

        let sweep = self.sweep.clone();
        let shutdown = self.shutdown.clone();
        let period = self.config.listener.sweep_interval().max(Duration::from_secs(1));
        self.workers.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick is immediate, and startup has already swept.
            interval.tick().await;
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(err) = sweep.run().await {
                            tracing::error!(error = ?err, "periodic recovery sweep failed");
                        }
                    },
                }
            }
        }));
        tracing::info!(buckets = self.config.buckets.len(), "tape offer started");
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn storage(&self) -> &BackupFileStorage {
        &self.storage
    }

    pub fn queue(&self) -> &WriteOrderQueue {
        &self.queue
    }

    pub fn containers(&self) -> &ContainerRepository {
        &self.containers
    }

    pub fn catalog(&self) -> &TapeCatalog {
        &self.catalog
    }

    pub fn pool(&self) -> &DevicePool {
        &self.pool
    }

    pub fn sweep(&self) -> &RecoverySweep {
        &self.sweep
    }

    /// Inventory of the library, as seen by the first free robot.
    pub async fn library_status(&self) -> Result<LibraryStatus> {
        let robot = self
            .pool
            .checkout_robot_timeout(self.config.listener.robot_checkout_timeout())
            .await
            .map_err(ErrorKind::device)?;
        robot.commands().status().await.map_err(ErrorKind::device)
    }

    /// Status of drive `index`, waiting for whoever is using it.
    pub async fn drive_status(&self, index: u32) -> Result<DriveStatus> {
        let drive = self
            .pool
            .checkout_drive_timeout(index, self.config.listener.robot_checkout_timeout())
            .await
            .map_err(ErrorKind::device)?;
        drive.commands().status().await.map_err(ErrorKind::device)
    }

    /// Seal what is open, stop the workers and close everything.
    ///
    /// In-flight transfers are given the configured grace period before
    /// their subprocess is killed; their orders stay queued for the next run.
    #[instrument("shutting down", skip(self))]
    pub async fn shutdown(self) {
        let sealed = self.storage.seal_all().await;
        if !sealed.is_empty() {
            tracing::info!(sealed = sealed.len(), "sealed open containers");
        }
        self.shutdown.cancel();
        self.queue.close();
        self.pool.close();
        for worker in self.workers {
            if let Err(err) = worker.await {
                tracing::error!(error = %err, "worker task failed");
            }
        }
        self.db.close().await;
        tracing::info!("tape offer stopped");
    }
}
