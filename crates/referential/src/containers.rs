//! Container lifecycle records.
//!
//! Every state change is a compare-and-swap keyed by container id: the update
//! only applies when the stored state is the one the caller expects. A failed
//! swap is reported as [`ErrorKind::PreconditionFailed`] and never retried
//! here, because it means another worker (or an earlier delivery of the same
//! write order) already moved the container on.

use crate::Database;
use crate::error::{ErrorKind, Result, map_constraint};
use crate::models::{ContainerEntry, ContainerRow, ContainerState, StateChange, path_to_string};
use exn::ResultExt;
use reel_archive::ContainerId;
use sqlx::SqlitePool;
use time::UtcDateTime;

#[derive(Debug, Clone)]
pub struct ContainerRepository {
    pool: SqlitePool,
}
impl From<&Database> for ContainerRepository {
    fn from(db: &Database) -> Self {
        Self { pool: db.pool().clone() }
    }
}
impl ContainerRepository {
    /// Record a new container.
    pub async fn save(&self, entry: &ContainerEntry) -> Result<()> {
        let row = ContainerRow::try_from(entry)?;
        sqlx::query(include_str!("../queries/insert_container.sql"))
            .bind(row.id)
            .bind(row.bucket)
            .bind(row.state)
            .bind(row.source_path)
            .bind(row.size)
            .bind(row.digest)
            .bind(row.segments)
            .bind(row.tape_label)
            .bind(row.tape_file)
            .bind(row.created_at)
            .bind(row.sealed_at)
            .bind(row.written_at)
            .execute(&self.pool)
            .await
            .map_err(|err| map_constraint(err, entry.id.as_str(), ErrorKind::AlreadyExists(entry.id.to_string())))?;
        tracing::debug!(container = %entry.id, bucket = %entry.bucket, state = %entry.state, "container saved");
        Ok(())
    }

    pub async fn find(&self, id: &ContainerId) -> Result<Option<ContainerEntry>> {
        let row: Option<ContainerRow> = sqlx::query_as(include_str!("../queries/get_container.sql"))
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        row.map(ContainerEntry::try_from).transpose()
    }

    /// Move a container from `from` into the state carried by `change`.
    ///
    /// Only single forward steps are accepted. Fails with
    /// [`ErrorKind::PreconditionFailed`] if the stored state isn't `from`, in
    /// which case nothing is written.
    pub async fn update_state(&self, id: &ContainerId, from: ContainerState, change: &StateChange) -> Result<()> {
        let to = change.state();
        if from.next() != Some(to) {
            exn::bail!(ErrorKind::InvalidTransition { from: from.to_string(), to: to.to_string() });
        }
        let now = UtcDateTime::now().unix_timestamp();
        let query = match change {
            StateChange::Sealed(container) => {
                if container.id != *id {
                    exn::bail!(ErrorKind::InvalidData("sealed container id"));
                }
                let sealed = ContainerRow::try_from(&ContainerEntry::ready(container))?;
                sqlx::query(include_str!("../queries/mark_container_ready.sql"))
                    .bind(id.as_str())
                    .bind(from.to_string())
                    .bind(path_to_string(&container.path)?)
                    .bind(sealed.size)
                    .bind(sealed.digest)
                    .bind(sealed.segments)
                    .bind(sealed.sealed_at)
            },
            StateChange::Written(tape) => sqlx::query(include_str!("../queries/mark_container_on_tape.sql"))
                .bind(id.as_str())
                .bind(from.to_string())
                .bind(tape.label.clone())
                .bind(i64::try_from(tape.file).or_raise(|| ErrorKind::InvalidData("tape file"))?)
                .bind(now),
        };
        let result = query.execute(&self.pool).await.or_raise(|| ErrorKind::Database)?;
        if result.rows_affected() == 0 {
            // Read back the current state to report why the swap didn't apply.
            let Some(current) = self.find(id).await? else {
                exn::bail!(ErrorKind::NotFound(id.to_string()));
            };
            exn::bail!(ErrorKind::PreconditionFailed {
                id: id.to_string(),
                expected: from.to_string(),
                actual: current.state.to_string(),
            });
        }
        tracing::debug!(container = %id, %from, %to, "container state updated");
        Ok(())
    }

    pub async fn list_by_state(&self, state: ContainerState) -> Result<Vec<ContainerEntry>> {
        let rows: Vec<ContainerRow> = sqlx::query_as(include_str!("../queries/list_containers_by_state.sql"))
            .bind(state.to_string())
            .fetch_all(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        rows.into_iter().map(ContainerEntry::try_from).collect()
    }

    /// Sealed containers that have no outstanding (pending or parked) write order.
    pub async fn list_stranded(&self) -> Result<Vec<ContainerEntry>> {
        let rows: Vec<ContainerRow> = sqlx::query_as(include_str!("../queries/list_stranded_containers.sql"))
            .fetch_all(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        rows.into_iter().map(ContainerEntry::try_from).collect()
    }

    /// Delete a container record that is still being built.
    ///
    /// Returns `false` if the container doesn't exist or has already been sealed.
    pub async fn discard_building(&self, id: &ContainerId) -> Result<bool> {
        let result = sqlx::query(include_str!("../queries/delete_building_container.sql"))
            .bind(id.as_str())
            .execute(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TapeAddress;
    use reel_archive::{Container, ContainerInfo, Segment};
    use std::path::PathBuf;

    async fn repository() -> ContainerRepository {
        let db = Database::connect_in_memory().await.unwrap();
        ContainerRepository::from(&db)
    }

    fn info() -> ContainerInfo {
        let id = ContainerId::generate();
        ContainerInfo {
            path: PathBuf::from("/srv/reel/input/backup").join(id.file_name()),
            id,
            bucket: "backup".to_string(),
            created_at: UtcDateTime::now(),
        }
    }

    fn seal(info: &ContainerInfo) -> Container {
        Container {
            id: info.id.clone(),
            bucket: info.bucket.clone(),
            path: info.path.clone(),
            size: 2048,
            digest: "d74981efa70a0c880b8d8c1985d075dbcbf679b99a5f9914e5aaf96b831a9e24".to_string(),
            segments: vec![Segment { name: "a".to_string(), offset: 512, size: 10 }],
            created_at: info.created_at,
            sealed_at: UtcDateTime::now(),
        }
    }

    fn tape(file: u64) -> StateChange {
        StateChange::Written(TapeAddress { label: "A00001L8".to_string(), file })
    }

    #[tokio::test]
    async fn test_full_lifecycle() {
        let repo = repository().await;
        let info = info();
        repo.save(&ContainerEntry::building(&info)).await.unwrap();
        assert_eq!(repo.find(&info.id).await.unwrap().unwrap().state, ContainerState::BuildingOnDisk);

        let container = seal(&info);
        repo.update_state(&info.id, ContainerState::BuildingOnDisk, &StateChange::Sealed(container.clone()))
            .await
            .unwrap();
        let entry = repo.find(&info.id).await.unwrap().unwrap();
        assert_eq!(entry.state, ContainerState::ReadyOnDisk);
        assert_eq!(entry.digest.as_deref(), Some(container.digest.as_str()));
        assert_eq!(entry.segments, container.segments);

        repo.update_state(&info.id, ContainerState::ReadyOnDisk, &tape(4)).await.unwrap();
        let entry = repo.find(&info.id).await.unwrap().unwrap();
        assert_eq!(entry.state, ContainerState::OnTape);
        assert_eq!(entry.tape, Some(TapeAddress { label: "A00001L8".to_string(), file: 4 }));
        assert!(entry.written_at.is_some());
    }

    #[tokio::test]
    async fn test_duplicate_transition_fails_without_changing_state() {
        let repo = repository().await;
        let container = seal(&info());
        repo.save(&ContainerEntry::ready(&container)).await.unwrap();

        repo.update_state(&container.id, ContainerState::ReadyOnDisk, &tape(0)).await.unwrap();
        let err = repo.update_state(&container.id, ContainerState::ReadyOnDisk, &tape(1)).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::PreconditionFailed { actual, .. } if actual == "ON_TAPE"));

        // The first write wins; the redelivered one didn't touch the record.
        let entry = repo.find(&container.id).await.unwrap().unwrap();
        assert_eq!(entry.state, ContainerState::OnTape);
        assert_eq!(entry.tape.unwrap().file, 0);
    }

    #[tokio::test]
    async fn test_rejects_backwards_and_skipping_transitions() {
        let repo = repository().await;
        let container = seal(&info());
        repo.save(&ContainerEntry::ready(&container)).await.unwrap();

        let err = repo.update_state(&container.id, ContainerState::OnTape, &tape(0)).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::InvalidTransition { .. }));
        let err = repo
            .update_state(&container.id, ContainerState::ReadyOnDisk, &StateChange::Sealed(container.clone()))
            .await
            .unwrap_err();
        assert!(matches!(&*err, ErrorKind::InvalidTransition { .. }));
        let err = repo
            .update_state(&container.id, ContainerState::BuildingOnDisk, &tape(0))
            .await
            .unwrap_err();
        assert!(matches!(&*err, ErrorKind::InvalidTransition { .. }));
        assert_eq!(repo.find(&container.id).await.unwrap().unwrap().state, ContainerState::ReadyOnDisk);
    }

    #[tokio::test]
    async fn test_update_unknown_container() {
        let repo = repository().await;
        let err = repo.update_state(&ContainerId::generate(), ContainerState::ReadyOnDisk, &tape(0)).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::NotFound(_)));
    }

    #[tokio::test]
    async fn test_save_twice_is_rejected() {
        let repo = repository().await;
        let entry = ContainerEntry::building(&info());
        repo.save(&entry).await.unwrap();
        let err = repo.save(&entry).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_discard_only_touches_building() {
        let repo = repository().await;
        let building = ContainerEntry::building(&info());
        let ready = ContainerEntry::ready(&seal(&info()));
        repo.save(&building).await.unwrap();
        repo.save(&ready).await.unwrap();

        let listed = repo.list_by_state(ContainerState::BuildingOnDisk).await.unwrap();
        assert_eq!(listed.iter().map(|entry| &entry.id).collect::<Vec<_>>(), [&building.id]);
        assert!(repo.discard_building(&building.id).await.unwrap());
        assert!(!repo.discard_building(&ready.id).await.unwrap());
        assert!(repo.find(&building.id).await.unwrap().is_none());
        assert!(repo.find(&ready.id).await.unwrap().is_some());
    }
}
