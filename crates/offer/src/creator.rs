//! Write-order creation for sealed containers.

use crate::error::{ErrorKind, Result};
use reel_archive::Container;
use reel_referential::error::ErrorKind as ReferentialErrorKind;
use reel_referential::{
    ContainerEntry, ContainerRepository, ContainerState, NewWriteOrder, StateChange, WriteOrder, WriteOrderQueue,
};

/// Moves sealed containers to `READY_ON_DISK` and queues them for tape.
///
/// The referential update and the enqueue are two separate writes. If the
/// process dies between them the container is stranded in `READY_ON_DISK`
/// without an order, which is exactly what the
/// [`RecoverySweep`](crate::RecoverySweep) looks for.
#[derive(Debug, Clone)]
pub struct WriteOrderCreator {
    containers: ContainerRepository,
    queue: WriteOrderQueue,
}
impl WriteOrderCreator {
    pub fn new(containers: ContainerRepository, queue: WriteOrderQueue) -> Self {
        Self { containers, queue }
    }

    /// Record a container sealed by a builder (it must already be recorded as
    /// `BUILDING_ON_DISK`), then queue it.
    pub async fn commit_sealed(&self, container: &Container) -> Result<Option<WriteOrder>> {
        self.containers
            .update_state(&container.id, ContainerState::BuildingOnDisk, &StateChange::Sealed(container.clone()))
            .await
            .map_err(ErrorKind::referential)?;
        Ok(self.enqueue(&ContainerEntry::ready(container)).await)
    }

    /// Record a container that was never built here (an out-of-band submission), then queue it.
    pub async fn commit_submitted(&self, container: &Container) -> Result<Option<WriteOrder>> {
        let entry = ContainerEntry::ready(container);
        self.containers.save(&entry).await.map_err(ErrorKind::referential)?;
        Ok(self.enqueue(&entry).await)
    }

    /// Queue a `READY_ON_DISK` container.
    ///
    /// Never fails: the container is already durable, and a missing order is
    /// repaired by the next sweep. Returns `None` when no new order was created.
    pub async fn enqueue(&self, entry: &ContainerEntry) -> Option<WriteOrder> {
        match self.queue.enqueue(&NewWriteOrder::from(entry)).await {
            Ok(order) => Some(order),
            Err(err) if matches!(&*err, ReferentialErrorKind::AlreadyQueued(_)) => {
                tracing::debug!(container = %entry.id, "container already has a write order");
                None
            },
            Err(err) => {
                tracing::error!(container = %entry.id, error = ?err, "could not enqueue write order, leaving it to the recovery sweep");
                None
            },
        }
    }
}
