//! Backup file storage: the entry point for everything that stores or reads objects.
//!
//! Objects are appended to the open container of their bucket. When a write
//! fills the container it is sealed, moved to `READY_ON_DISK` and queued for
//! tape before the write returns. Reads are served from local disk when the
//! container is still there, and otherwise from a copy read back from tape
//! into the bounded [`ReadCache`]. A container purged while it is being read
//! is looked up again and read from tape.

use crate::cache::{CachePin, ReadCache};
use crate::creator::WriteOrderCreator;
use crate::error::{ErrorKind, Result};
use crate::mount;
use reel_archive::error::ErrorKind as ArchiveErrorKind;
use reel_archive::{Container, ContainerBuilder, ContainerId};
use reel_config::Config;
use reel_device::{DevicePool, TapeTarget};
use reel_referential::{ContainerEntry, ContainerRepository, ContainerState, TapeAddress};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use time::UtcDateTime;
use tokio::sync::Mutex;
use tracing::instrument;

/// Where a freshly written object ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerRef {
    pub id: ContainerId,
    pub bucket: String,
    /// Name of the object inside the container.
    pub name: String,
    /// State of the container right after the write.
    pub state: ContainerState,
}

/// A verified local copy of a sealed container: the original, or a copy in
/// the read cache that stays pinned until this is dropped.
pub struct LocalCopy {
    path: PathBuf,
    pin: Option<CachePin>,
}

impl LocalCopy {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether this is a copy read back from tape.
    pub fn is_cached(&self) -> bool {
        self.pin.is_some()
    }
}

struct Bucket {
    drive: u32,
    builder: Arc<Mutex<ContainerBuilder>>,
}

#[derive(Clone)]
pub struct BackupFileStorage {
    buckets: Arc<HashMap<String, Bucket>>,
    containers: ContainerRepository,
    creator: WriteOrderCreator,
    pool: DevicePool,
    input_dir: PathBuf,
    cache: ReadCache,
    device_timeout: Duration,
    // Tape reads are staged one at a time.
    staging: Arc<Mutex<()>>,
}

impl BackupFileStorage {
    pub fn new(config: &Config, containers: ContainerRepository, creator: WriteOrderCreator, pool: DevicePool) -> Self {
        let buckets = config
            .buckets
            .iter()
            .map(|(name, topology)| {
                let dir = config.storage.input_dir.join(name);
                let builder = ContainerBuilder::new(name.clone(), dir, config.storage.container_threshold);
                (name.clone(), Bucket { drive: topology.drive, builder: Arc::new(Mutex::new(builder)) })
            })
            .collect();
        Self {
            buckets: Arc::new(buckets),
            containers,
            creator,
            pool,
            input_dir: config.storage.input_dir.clone(),
            cache: ReadCache::new(&config.storage.read_cache_dir, config.storage.read_cache_capacity),
            device_timeout: config.listener.robot_checkout_timeout(),
            staging: Arc::new(Mutex::new(())),
        }
    }

    pub fn cache(&self) -> &ReadCache {
        &self.cache
    }

    /// Configured bucket names, sorted.
    pub fn buckets(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.buckets.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    fn bucket(&self, name: &str) -> Result<&Bucket> {
        match self.buckets.get(name) {
            Some(bucket) => Ok(bucket),
            None => exn::bail!(ErrorKind::NotFound(format!("bucket {name}"))),
        }
    }

    /// Append one object to the bucket's open container.
    ///
    /// The object is only durable once its container is at least
    /// `READY_ON_DISK`: a crash while the container is still being built loses
    /// it.
    #[instrument("writing object", skip(self, bytes), fields(size = bytes.len()))]
    pub async fn write(&self, bucket: &str, name: &str, bytes: Vec<u8>) -> Result<ContainerRef> {
        let builder = self.bucket(bucket)?.builder.clone().lock_owned().await;
        let previous = builder.current().map(|info| info.id.clone());
        let object = name.to_string();
        let (mut builder, outcome) = tokio::task::spawn_blocking(move || {
            let mut builder = builder;
            let outcome = builder.add_object(&object, &bytes);
            (builder, outcome)
        })
        .await
        .map_err(|err| ErrorKind::Internal(err.to_string()))?;

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(err) => {
                // The builder drops its open container when an append fails.
                if let Some(previous) = previous.filter(|id| builder.current().map(|info| &info.id) != Some(id)) {
                    self.forget_building(&previous).await;
                }
                return Err(ErrorKind::archive(err));
            },
        };
        if let Some(info) = &outcome.opened
            && let Err(err) = self.containers.save(&ContainerEntry::building(info)).await
        {
            if outcome.sealed.is_some() {
                remove_file(&info.path).await;
            } else {
                builder.abandon();
            }
            return Err(ErrorKind::referential(err));
        }
        let state = match &outcome.sealed {
            Some(container) => {
                self.creator.commit_sealed(container).await?;
                ContainerState::ReadyOnDisk
            },
            None => ContainerState::BuildingOnDisk,
        };
        drop(builder);
        Ok(ContainerRef { id: outcome.container_id, bucket: bucket.to_string(), name: name.to_string(), state })
    }

    async fn forget_building(&self, id: &ContainerId) {
        match self.containers.discard_building(id).await {
            Ok(_) => tracing::warn!(container = %id, "container abandoned after a failed append"),
            Err(err) => tracing::error!(container = %id, error = ?err, "could not discard abandoned container"),
        }
    }

    /// Seal the bucket's open container, if it holds anything, and queue it for tape.
    #[instrument("sealing container", skip(self))]
    pub async fn seal(&self, bucket: &str) -> Result<Option<ContainerId>> {
        let builder = self.bucket(bucket)?.builder.clone().lock_owned().await;
        let previous = builder.current().map(|info| info.id.clone());
        let (builder, sealed) = tokio::task::spawn_blocking(move || {
            let mut builder = builder;
            let sealed = builder.seal();
            (builder, sealed)
        })
        .await
        .map_err(|err| ErrorKind::Internal(err.to_string()))?;
        let container = match sealed {
            Ok(Some(container)) => container,
            Ok(None) => return Ok(None),
            Err(err) => {
                if let Some(previous) = &previous {
                    self.forget_building(previous).await;
                }
                return Err(ErrorKind::archive(err));
            },
        };
        self.creator.commit_sealed(&container).await?;
        drop(builder);
        Ok(Some(container.id))
    }

    /// Seal every bucket's open container. Failures are logged, not returned.
    pub async fn seal_all(&self) -> Vec<ContainerId> {
        let mut sealed = Vec::new();
        for bucket in self.buckets() {
            match self.seal(bucket).await {
                Ok(Some(id)) => sealed.push(id),
                Ok(None) => {},
                Err(err) => tracing::error!(bucket, error = ?err, "could not seal open container"),
            }
        }
        sealed
    }

    pub async fn entry(&self, id: &ContainerId) -> Result<ContainerEntry> {
        match self.containers.find(id).await.map_err(ErrorKind::referential)? {
            Some(entry) => Ok(entry),
            None => exn::bail!(ErrorKind::NotFound(format!("container {id}"))),
        }
    }

    pub async fn status(&self, id: &ContainerId) -> Result<ContainerState> {
        Ok(self.entry(id).await?.state)
    }

    /// The whole container, whatever its state.
    ///
    /// A container that is still being built is returned as it currently is
    /// on disk: the objects appended so far, without the end-of-archive marker.
    pub async fn get(&self, id: &ContainerId) -> Result<Vec<u8>> {
        let entry = self.entry(id).await?;
        self.read_container(entry).await
    }

    async fn read_container(&self, mut entry: ContainerEntry) -> Result<Vec<u8>> {
        let id = entry.id.clone();
        if entry.state == ContainerState::BuildingOnDisk {
            let read = {
                // Hold the builder so no append is half-way through while reading.
                let _builder = self.bucket(&entry.bucket)?.builder.lock().await;
                tokio::fs::read(&entry.path).await
            };
            match read {
                Ok(bytes) => return Ok(bytes),
                // Sealed (and maybe purged) since the entry was read.
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    entry = self.entry(&id).await?;
                    if entry.state == ContainerState::BuildingOnDisk {
                        exn::bail!(ErrorKind::PreconditionFailed(format!("container {id} has no file yet")));
                    }
                },
                Err(err) => exn::bail!(ErrorKind::Internal(err.to_string())),
            }
        }
        self.read_sealed(entry, |path| {
            std::fs::read(path).map_err(|err| exn::Exn::from(ErrorKind::Internal(err.to_string())))
        })
        .await
    }

    /// One object out of a sealed container.
    pub async fn read_object(&self, id: &ContainerId, name: &str) -> Result<Vec<u8>> {
        let entry = self.entry(id).await?;
        let Some(container) = entry.container() else {
            exn::bail!(ErrorKind::PreconditionFailed(format!("container {id} is not sealed yet")));
        };
        let name = name.to_string();
        self.read_sealed(entry, move |path| {
            let mut container = container.clone();
            container.path = path.to_path_buf();
            reel_archive::read_object(&container, &name).map_err(ErrorKind::archive)
        })
        .await
    }

    /// Run `read` on a local copy of a sealed container. An original purged
    /// between verification and `read` is fetched again, from tape.
    async fn read_sealed<T, F>(&self, mut entry: ContainerEntry, read: F) -> Result<T>
    where
        T: Send + 'static,
        F: Fn(&Path) -> Result<T> + Clone + Send + 'static,
    {
        let mut refetched = false;
        loop {
            let copy = self.fetch(&entry).await?;
            let path = copy.path().to_path_buf();
            let outcome = {
                let read = read.clone();
                let path = path.clone();
                tokio::task::spawn_blocking(move || read(&path))
                    .await
                    .map_err(|err| ErrorKind::Internal(err.to_string()))?
            };
            let vanished = outcome.is_err() && !copy.is_cached() && !tokio::fs::try_exists(&path).await.unwrap_or(true);
            drop(copy);
            if !vanished || refetched {
                return outcome;
            }
            tracing::info!(container = %entry.id, "local container purged while reading, fetching it again");
            refetched = true;
            entry = self.entry(&entry.id).await?;
        }
    }

    /// A verified local copy of a sealed container, reading it back from tape
    /// into the read cache if the original is gone.
    ///
    /// An entry read before the container went to tape is looked up again
    /// when its original turns out to be missing.
    #[instrument("fetching container", skip(self, entry), fields(container = %entry.id))]
    pub async fn fetch(&self, entry: &ContainerEntry) -> Result<LocalCopy> {
        let Some(digest) = entry.digest.as_deref() else {
            exn::bail!(ErrorKind::PreconditionFailed(format!("container {} is not sealed yet", entry.id)));
        };
        if is_intact(&entry.path, digest).await {
            return Ok(LocalCopy { path: entry.path.clone(), pin: None });
        }
        let fresh;
        let entry = match entry.tape {
            Some(_) => entry,
            None => {
                fresh = self.entry(&entry.id).await?;
                &fresh
            },
        };
        let Some(tape) = &entry.tape else {
            exn::bail!(ErrorKind::Internal(format!("container {} is not on tape and its local copy is unusable", entry.id)));
        };
        let cached = self.cache.path_for(&entry.bucket, &entry.id);
        if let Some(copy) = self.cached_copy(&cached, digest).await {
            return Ok(copy);
        }
        let _staging = self.staging.lock().await;
        // Someone else may have staged it while we waited.
        if let Some(copy) = self.cached_copy(&cached, digest).await {
            return Ok(copy);
        }
        let pin = self.cache.reserve(&cached, entry.size.unwrap_or_default()).await;
        match self.stage(entry, tape, digest, &cached).await {
            Ok(size) => {
                self.cache.complete(&cached, size);
                Ok(LocalCopy { path: cached, pin: Some(pin) })
            },
            Err(err) => {
                drop(pin);
                self.cache.forget(&cached).await;
                Err(err)
            },
        }
    }

    async fn cached_copy(&self, cached: &Path, digest: &str) -> Option<LocalCopy> {
        let pin = self.cache.pin(cached)?;
        if is_intact(cached, digest).await {
            return Some(LocalCopy { path: cached.to_path_buf(), pin: Some(pin) });
        }
        drop(pin);
        self.cache.forget(cached).await;
        None
    }

    async fn stage(&self, entry: &ContainerEntry, tape: &TapeAddress, digest: &str, cached: &Path) -> Result<u64> {
        let index = self.bucket(&entry.bucket)?.drive;
        let parent = cached.parent().unwrap_or(self.cache.dir());
        tokio::fs::create_dir_all(parent).await.map_err(|err| ErrorKind::Internal(err.to_string()))?;
        let partial = cached.with_extension("partial");

        let drive = self.pool.checkout_drive_timeout(index, self.device_timeout).await.map_err(ErrorKind::device)?;
        mount::ensure_loaded(&self.pool, &drive, &tape.label, self.device_timeout).await?;
        let target = TapeTarget::new(tape.label.clone(), tape.file);
        tracing::info!(%target, "reading container back from tape");
        let read = drive.read(&target, &partial).await.map_err(ErrorKind::device);
        drop(drive);
        if let Err(err) = read {
            remove_file(&partial).await;
            return Err(err);
        }

        let path = partial.clone();
        let expected = digest.to_string();
        let verified = tokio::task::spawn_blocking(move || reel_archive::verify(&path, &expected))
            .await
            .map_err(|err| ErrorKind::Internal(err.to_string()))?;
        let size = match verified {
            Ok(size) => size,
            Err(err) => {
                tracing::error!(alert = true, tape = %tape, error = ?err, "container read back from tape is corrupt");
                remove_file(&partial).await;
                return Err(ErrorKind::archive(err));
            },
        };
        tokio::fs::rename(&partial, cached).await.map_err(|err| ErrorKind::Internal(err.to_string()))?;
        Ok(size)
    }

    /// Commit a container built elsewhere straight to tape, bypassing the builder.
    ///
    /// The file is copied into the bucket's input directory, indexed from its
    /// tar headers, and queued like any sealed container.
    #[instrument("submitting container", skip(self, source), fields(source = %source.display()))]
    pub async fn submit_container(&self, bucket: &str, source: &Path) -> Result<ContainerId> {
        self.bucket(bucket)?;
        let id = ContainerId::generate();
        let destination = self.input_dir.join(bucket).join(id.file_name());
        let prepared = {
            let source = source.to_path_buf();
            let destination = destination.clone();
            tokio::task::spawn_blocking(move || prepare_submission(&source, &destination))
                .await
                .map_err(|err| ErrorKind::Internal(err.to_string()))?
        };
        let (size, digest, segments) = match prepared {
            Ok(prepared) => prepared,
            Err(err) => {
                remove_file(&destination).await;
                return Err(err);
            },
        };
        let now = UtcDateTime::now();
        let container = Container {
            id: id.clone(),
            bucket: bucket.to_string(),
            path: destination.clone(),
            size,
            digest,
            segments,
            created_at: now,
            sealed_at: now,
        };
        if let Err(err) = self.creator.commit_submitted(&container).await {
            remove_file(&destination).await;
            return Err(err);
        }
        tracing::info!(container = %id, size, objects = container.segments.len(), "container submitted");
        Ok(id)
    }
}

fn prepare_submission(source: &Path, destination: &Path) -> Result<(u64, String, Vec<reel_archive::Segment>)> {
    let segments = reel_archive::index(source).map_err(ErrorKind::archive)?;
    if segments.is_empty() {
        exn::bail!(ErrorKind::Archive(ArchiveErrorKind::Malformed(format!("{} holds no objects", source.display()))));
    }
    if let Some(parent) = destination.parent() {
        std::fs::create_dir_all(parent).map_err(|err| ErrorKind::Internal(err.to_string()))?;
    }
    std::fs::copy(source, destination).map_err(|err| ErrorKind::Internal(err.to_string()))?;
    let (size, digest) = reel_archive::digest_file(destination).map_err(ErrorKind::archive)?;
    Ok((size, digest, segments))
}

async fn is_intact(path: &Path, digest: &str) -> bool {
    if !tokio::fs::try_exists(path).await.unwrap_or(false) {
        return false;
    }
    let owned = path.to_path_buf();
    let expected = digest.to_string();
    match tokio::task::spawn_blocking(move || reel_archive::verify(&owned, &expected)).await {
        Ok(Ok(_)) => true,
        Ok(Err(err)) => {
            tracing::warn!(path = %path.display(), error = ?err, "local container copy failed verification");
            false
        },
        Err(err) => {
            tracing::error!(error = %err, "verification task failed");
            false
        },
    }
}

async fn remove_file(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {},
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {},
        Err(err) => tracing::warn!(path = %path.display(), error = %err, "could not remove file"),
    }
}
