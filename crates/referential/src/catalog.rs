//! Tape catalog: which cartridges a bucket may use and how far each has been written.

use crate::Database;
use crate::error::{ErrorKind, Result};
use crate::models::{TapeRecord, TapeRow, TapeState};
use exn::ResultExt;
use sqlx::SqlitePool;
use time::UtcDateTime;

#[derive(Debug, Clone)]
pub struct TapeCatalog {
    pool: SqlitePool,
}
impl From<&Database> for TapeCatalog {
    fn from(db: &Database) -> Self {
        Self { pool: db.pool().clone() }
    }
}
impl TapeCatalog {
    /// Add a blank cartridge to the catalog. Known cartridges are left untouched.
    pub async fn register(&self, label: &str, bucket: &str) -> Result<TapeRecord> {
        sqlx::query(include_str!("../queries/register_tape.sql"))
            .bind(label)
            .bind(bucket)
            .bind(UtcDateTime::now().unix_timestamp())
            .execute(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        let Some(tape) = self.find(label).await? else {
            exn::bail!(ErrorKind::NotFound(label.to_string()));
        };
        if tape.bucket != bucket {
            tracing::warn!(label, registered = %tape.bucket, configured = bucket, "tape is catalogued under another bucket");
        }
        Ok(tape)
    }

    pub async fn find(&self, label: &str) -> Result<Option<TapeRecord>> {
        let row: Option<TapeRow> = sqlx::query_as(include_str!("../queries/get_tape.sql"))
            .bind(label)
            .fetch_optional(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        row.map(TapeRecord::try_from).transpose()
    }

    pub async fn list(&self, bucket: Option<&str>) -> Result<Vec<TapeRecord>> {
        let rows: Vec<TapeRow> = sqlx::query_as(include_str!("../queries/list_tapes.sql"))
            .bind(bucket)
            .fetch_all(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        rows.into_iter().map(TapeRecord::try_from).collect()
    }

    /// The first of `labels` (in order) that can still be written to.
    pub async fn select_writable(&self, bucket: &str, labels: &[String]) -> Result<Option<TapeRecord>> {
        for label in labels {
            let tape = match self.find(label).await? {
                Some(tape) => tape,
                None => self.register(label, bucket).await?,
            };
            if tape.state.is_writable() && tape.bucket == bucket {
                return Ok(Some(tape));
            }
        }
        Ok(None)
    }

    /// Account for one more file written at position `file` of tape `label`.
    ///
    /// Fails with [`ErrorKind::PreconditionFailed`] if the catalog no longer
    /// expects the next file at that position.
    pub async fn record_write(&self, label: &str, file: u64, bytes: u64) -> Result<TapeRecord> {
        let row: Option<TapeRow> = sqlx::query_as(include_str!("../queries/record_tape_write.sql"))
            .bind(label)
            .bind(i64::try_from(file).or_raise(|| ErrorKind::InvalidData("file count"))?)
            .bind(i64::try_from(bytes).or_raise(|| ErrorKind::InvalidData("written bytes"))?)
            .bind(UtcDateTime::now().unix_timestamp())
            .fetch_optional(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        match row {
            Some(row) => TapeRecord::try_from(row),
            None => {
                let Some(tape) = self.find(label).await? else {
                    exn::bail!(ErrorKind::NotFound(label.to_string()));
                };
                exn::bail!(ErrorKind::PreconditionFailed {
                    id: label.to_string(),
                    expected: format!("{} file {file}", TapeState::Open),
                    actual: format!("{} file {}", tape.state, tape.file_count),
                });
            },
        }
    }

    pub async fn set_state(&self, label: &str, state: TapeState) -> Result<TapeRecord> {
        let row: Option<TapeRow> = sqlx::query_as(include_str!("../queries/set_tape_state.sql"))
            .bind(label)
            .bind(state.to_string())
            .bind(UtcDateTime::now().unix_timestamp())
            .fetch_optional(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        let Some(row) = row else {
            exn::bail!(ErrorKind::NotFound(label.to_string()));
        };
        tracing::info!(label, %state, "tape state changed");
        TapeRecord::try_from(row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn catalog() -> TapeCatalog {
        let db = Database::connect_in_memory().await.unwrap();
        TapeCatalog::from(&db)
    }

    fn labels(labels: &[&str]) -> Vec<String> {
        labels.iter().map(|label| label.to_string()).collect()
    }

    #[tokio::test]
    async fn test_register_is_idempotent() {
        let catalog = catalog().await;
        let tape = catalog.register("A00001L8", "backup").await.unwrap();
        assert_eq!(tape.state, TapeState::Empty);
        catalog.record_write("A00001L8", 0, 100).await.unwrap();
        let again = catalog.register("A00001L8", "backup").await.unwrap();
        assert_eq!(again.file_count, 1);
        assert_eq!(catalog.list(Some("backup")).await.unwrap().len(), 1);
        assert!(catalog.list(Some("other")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_record_write_advances_position() {
        let catalog = catalog().await;
        catalog.register("A00001L8", "backup").await.unwrap();
        let tape = catalog.record_write("A00001L8", 0, 100).await.unwrap();
        assert_eq!((tape.state, tape.file_count, tape.written_bytes), (TapeState::Open, 1, 100));
        let tape = catalog.record_write("A00001L8", 1, 50).await.unwrap();
        assert_eq!((tape.file_count, tape.written_bytes), (2, 150));

        // A stale position means someone else wrote in between.
        let err = catalog.record_write("A00001L8", 1, 50).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::PreconditionFailed { .. }));
        let err = catalog.record_write("B00001L8", 0, 50).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::NotFound(_)));
    }

    #[tokio::test]
    async fn test_select_skips_full_and_conflicting_tapes() {
        let catalog = catalog().await;
        let all = labels(&["A00001L8", "A00002L8", "A00003L8"]);
        assert_eq!(catalog.select_writable("backup", &all).await.unwrap().unwrap().label, "A00001L8");

        catalog.set_state("A00001L8", TapeState::Full).await.unwrap();
        catalog.register("A00002L8", "backup").await.unwrap();
        catalog.set_state("A00002L8", TapeState::Conflict).await.unwrap();
        assert_eq!(catalog.select_writable("backup", &all).await.unwrap().unwrap().label, "A00003L8");

        catalog.set_state("A00003L8", TapeState::Full).await.unwrap();
        assert!(catalog.select_writable("backup", &all).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_full_tape_refuses_writes() {
        let catalog = catalog().await;
        catalog.register("A00001L8", "backup").await.unwrap();
        catalog.set_state("A00001L8", TapeState::Full).await.unwrap();
        let err = catalog.record_write("A00001L8", 0, 1).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::PreconditionFailed { .. }));
    }
}
