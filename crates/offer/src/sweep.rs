//! Recovery sweep.
//!
//! A container in `READY_ON_DISK` with no outstanding write order would never
//! reach tape. The sweep finds them and queues them again; it runs on startup
//! and then periodically. Parked orders count as outstanding: those wait for
//! an operator, not for the sweep.
//!
//! Before anything is built, [`bootstrap`](RecoverySweep::bootstrap) deals
//! with what a crashed process left in the input directory: half-built
//! containers are cut back to their last complete object and sealed, and
//! container files nobody has a record of are removed.

use crate::creator::WriteOrderCreator;
use crate::error::{ErrorKind, Result};
use reel_archive::{ContainerId, ContainerInfo};
use reel_referential::{ContainerEntry, ContainerRepository, ContainerState};
use std::path::{Path, PathBuf};
use tracing::instrument;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Stranded containers found.
    pub stranded: Vec<ContainerId>,
    /// Of those, the ones that got a new write order.
    pub requeued: Vec<ContainerId>,
}

/// What [`bootstrap`](RecoverySweep::bootstrap) found left behind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BootstrapReport {
    /// Half-built containers sealed with the objects that made it to disk.
    pub sealed: Vec<ContainerId>,
    /// Half-built containers without a single complete object.
    pub discarded: Vec<ContainerId>,
    /// Container files removed because no record points at them.
    pub orphans: Vec<PathBuf>,
}
impl BootstrapReport {
    pub fn is_empty(&self) -> bool {
        self.sealed.is_empty() && self.discarded.is_empty() && self.orphans.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct RecoverySweep {
    containers: ContainerRepository,
    creator: WriteOrderCreator,
    input_dir: PathBuf,
}
impl RecoverySweep {
    pub fn new(containers: ContainerRepository, creator: WriteOrderCreator, input_dir: impl Into<PathBuf>) -> Self {
        Self { containers, creator, input_dir: input_dir.into() }
    }

    /// Re-enqueue every stranded container.
    #[instrument("recovery sweep", skip(self))]
    pub async fn run(&self) -> Result<SweepReport> {
        let stranded = self.containers.list_stranded().await.map_err(ErrorKind::referential)?;
        let mut report = SweepReport::default();
        for entry in stranded {
            tracing::warn!(container = %entry.id, bucket = %entry.bucket, "container is ready but has no write order");
            if !tokio::fs::try_exists(&entry.path).await.unwrap_or(false) {
                tracing::error!(alert = true, container = %entry.id, path = %entry.path.display(), "stranded container file is missing");
            }
            if self.creator.enqueue(&entry).await.is_some() {
                report.requeued.push(entry.id.clone());
            }
            report.stranded.push(entry.id);
        }
        if !report.stranded.is_empty() {
            tracing::info!(stranded = report.stranded.len(), requeued = report.requeued.len(), "recovery sweep done");
        }
        Ok(report)
    }

    /// Repair what a previous process left half-done in the input directory.
    ///
    /// Only safe to call before anything starts building: a container file is
    /// created a moment before its record.
    #[instrument("bootstrap recovery", skip(self))]
    pub async fn bootstrap(&self) -> Result<BootstrapReport> {
        let mut report = BootstrapReport::default();
        let building = self.containers.list_by_state(ContainerState::BuildingOnDisk).await.map_err(ErrorKind::referential)?;
        for entry in building {
            let info = ContainerInfo {
                id: entry.id.clone(),
                bucket: entry.bucket.clone(),
                path: entry.path.clone(),
                created_at: entry.created_at,
            };
            let repaired = tokio::task::spawn_blocking(move || reel_archive::repair(&info))
                .await
                .map_err(|err| ErrorKind::Internal(err.to_string()))?;
            match repaired {
                Ok(Some(container)) => {
                    tracing::warn!(
                        container = %container.id,
                        bucket = %container.bucket,
                        objects = container.segments.len(),
                        "sealing container left half-built by a previous run"
                    );
                    self.creator.commit_sealed(&container).await?;
                    report.sealed.push(container.id);
                },
                Ok(None) => {
                    if self.discard(&entry).await? {
                        report.discarded.push(entry.id);
                    }
                },
                Err(err) => {
                    tracing::error!(alert = true, container = %entry.id, path = %entry.path.display(), error = ?err, "could not repair half-built container, leaving it to an operator");
                },
            }
        }
        report.orphans = self.remove_orphans().await?;
        Ok(report)
    }

    async fn discard(&self, entry: &ContainerEntry) -> Result<bool> {
        if !self.containers.discard_building(&entry.id).await.map_err(ErrorKind::referential)? {
            return Ok(false);
        }
        tracing::warn!(container = %entry.id, bucket = %entry.bucket, "discarding half-built container with no complete object");
        remove_file(&entry.path).await;
        Ok(true)
    }

    /// Remove `{input_dir}/{bucket}/{id}.tar` files that have no container record.
    async fn remove_orphans(&self) -> Result<Vec<PathBuf>> {
        let mut removed = Vec::new();
        let mut buckets = match tokio::fs::read_dir(&self.input_dir).await {
            Ok(buckets) => buckets,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(removed),
            Err(err) => exn::bail!(ErrorKind::Internal(format!("{}: {err}", self.input_dir.display()))),
        };
        while let Some(bucket) = buckets.next_entry().await.map_err(internal)? {
            if !bucket.file_type().await.map_err(internal)?.is_dir() {
                continue;
            }
            let mut files = tokio::fs::read_dir(bucket.path()).await.map_err(internal)?;
            while let Some(file) = files.next_entry().await.map_err(internal)? {
                let path = file.path();
                let Some(id) = container_id(&path) else {
                    continue;
                };
                if self.containers.find(&id).await.map_err(ErrorKind::referential)?.is_some() {
                    continue;
                }
                tracing::warn!(path = %path.display(), "removing container file no record points at");
                remove_file(&path).await;
                removed.push(path);
            }
        }
        Ok(removed)
    }
}

/// The container a `{id}.tar` file belongs to.
fn container_id(path: &Path) -> Option<ContainerId> {
    if path.extension()? != "tar" {
        return None;
    }
    path.file_stem()?.to_str()?.parse().ok()
}

fn internal(err: std::io::Error) -> ErrorKind {
    ErrorKind::Internal(err.to_string())
}

async fn remove_file(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {},
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {},
        Err(err) => tracing::error!(path = %path.display(), error = %err, "could not remove container file"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reel_archive::ContainerBuilder;
    use reel_referential::{ContainerEntry, Database, WriteOrderQueue};

    struct Fixture {
        containers: ContainerRepository,
        queue: WriteOrderQueue,
        sweep: RecoverySweep,
        dir: tempfile::TempDir,
    }

    async fn fixture() -> Fixture {
        let db = Database::connect_in_memory().await.unwrap();
        let containers = ContainerRepository::from(&db);
        let queue = WriteOrderQueue::from(&db);
        let creator = WriteOrderCreator::new(containers.clone(), queue.clone());
        let dir = tempfile::tempdir().unwrap();
        let sweep = RecoverySweep::new(containers.clone(), creator, dir.path());
        Fixture { containers, queue, sweep, dir }
    }

    #[tokio::test]
    async fn test_requeues_stranded_containers_once() {
        let f = fixture().await;
        let mut builder = ContainerBuilder::new("backup", f.dir.path(), 1);
        let container = builder.add_object("a", b"alpha").unwrap().sealed.unwrap();
        // Saved as ready, but the process "died" before enqueueing.
        f.containers.save(&ContainerEntry::ready(&container)).await.unwrap();

        let report = f.sweep.run().await.unwrap();
        assert_eq!(report.requeued, [container.id.clone()]);
        let report = f.sweep.run().await.unwrap();
        assert!(report.stranded.is_empty());
        assert_eq!(f.queue.find_for_container(&container.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_parked_orders_are_not_stranded() {
        let f = fixture().await;
        let mut builder = ContainerBuilder::new("backup", f.dir.path(), 1);
        let container = builder.add_object("a", b"alpha").unwrap().sealed.unwrap();
        let entry = ContainerEntry::ready(&container);
        f.containers.save(&entry).await.unwrap();
        let order = f.queue.enqueue(&(&entry).into()).await.unwrap();
        f.queue.park(order.id).await.unwrap();
        assert!(f.sweep.run().await.unwrap().stranded.is_empty());
    }

    #[tokio::test]
    async fn test_bootstrap_seals_half_built_containers() {
        let f = fixture().await;
        let mut builder = ContainerBuilder::new("backup", f.dir.path().join("backup"), 1 << 20);
        let info = builder.add_object("a", b"alpha").unwrap().opened.unwrap();
        builder.add_object("b", b"bravo").unwrap();
        f.containers.save(&ContainerEntry::building(&info)).await.unwrap();
        // The process dies: whatever the builder had not written is lost.
        std::mem::forget(builder);

        let report = f.sweep.bootstrap().await.unwrap();
        assert_eq!(report.sealed, [info.id.clone()]);
        assert!(report.discarded.is_empty() && report.orphans.is_empty());
        let entry = f.containers.find(&info.id).await.unwrap().unwrap();
        assert_eq!(entry.state, ContainerState::ReadyOnDisk);
        let container = entry.container().unwrap();
        assert_eq!(reel_archive::read_object(&container, "b").unwrap(), b"bravo");
        assert_eq!(f.queue.find_for_container(&info.id).await.unwrap().len(), 1);
        assert!(f.sweep.bootstrap().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_bootstrap_discards_containers_with_nothing_complete() {
        let f = fixture().await;
        let mut builder = ContainerBuilder::new("backup", f.dir.path().join("backup"), 1 << 20);
        let info = builder.add_object("a", b"alpha").unwrap().opened.unwrap();
        f.containers.save(&ContainerEntry::building(&info)).await.unwrap();
        std::mem::forget(builder);
        // Torn in the middle of the first header.
        std::fs::OpenOptions::new().write(true).open(&info.path).unwrap().set_len(100).unwrap();

        let report = f.sweep.bootstrap().await.unwrap();
        assert_eq!(report.discarded, [info.id.clone()]);
        assert!(!info.path.exists());
        assert!(f.containers.find(&info.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_bootstrap_removes_files_without_records() {
        let f = fixture().await;
        let mut builder = ContainerBuilder::new("backup", f.dir.path().join("backup"), 1);
        let known = builder.add_object("a", b"alpha").unwrap().sealed.unwrap();
        f.containers.save(&ContainerEntry::ready(&known)).await.unwrap();
        let orphan = builder.add_object("b", b"bravo").unwrap().sealed.unwrap();
        let unrelated = f.dir.path().join("backup").join("notes.txt");
        std::fs::write(&unrelated, b"not a container").unwrap();

        let report = f.sweep.bootstrap().await.unwrap();
        assert_eq!(report.orphans, [orphan.path.clone()]);
        assert!(!orphan.path.exists());
        assert!(known.path.exists());
        assert!(unrelated.exists());
    }

    #[tokio::test]
    async fn test_bootstrap_without_input_directory() {
        let db = Database::connect_in_memory().await.unwrap();
        let containers = ContainerRepository::from(&db);
        let creator = WriteOrderCreator::new(containers.clone(), WriteOrderQueue::from(&db));
        let sweep = RecoverySweep::new(containers, creator, "/nonexistent/reel/input");
        assert!(sweep.bootstrap().await.unwrap().is_empty());
    }
}
