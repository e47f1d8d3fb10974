use crate::error::{Error, ErrorKind};
use crate::models::ContainerEntry;
use exn::ResultExt;
use reel_archive::ContainerId;
use std::path::PathBuf;
use time::UtcDateTime;

/// An order as handed to [`WriteOrderQueue::enqueue`](crate::WriteOrderQueue::enqueue).
/// The queue assigns the sequence number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewWriteOrder {
    pub container_id: ContainerId,
    pub bucket: String,
    pub source_path: PathBuf,
}
impl From<&ContainerEntry> for NewWriteOrder {
    fn from(entry: &ContainerEntry) -> Self {
        Self { container_id: entry.id.clone(), bucket: entry.bucket.clone(), source_path: entry.path.clone() }
    }
}

/// A durable instruction to commit one sealed container to tape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteOrder {
    pub id: i64,
    pub container_id: ContainerId,
    pub bucket: String,
    /// Monotonic per bucket; delivery follows it.
    pub sequence: u64,
    pub source_path: PathBuf,
    pub enqueued_at: UtcDateTime,
    pub acknowledged: bool,
    pub acknowledged_at: Option<UtcDateTime>,
    /// Deliveries that didn't end in an acknowledgement.
    pub attempts: u32,
    /// Given up on until an operator requeues it.
    pub parked: bool,
}

#[derive(sqlx::FromRow)]
pub(crate) struct WriteOrderRow {
    id: i64,
    container_id: String,
    bucket: String,
    sequence: i64,
    source_path: String,
    enqueued_at: i64,
    acknowledged: bool,
    acknowledged_at: Option<i64>,
    attempts: i64,
    parked: bool,
}
impl TryFrom<WriteOrderRow> for WriteOrder {
    type Error = Error;
    fn try_from(row: WriteOrderRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            container_id: row.container_id.parse::<ContainerId>().or_raise(|| ErrorKind::InvalidData("container id"))?,
            bucket: row.bucket,
            sequence: u64::try_from(row.sequence).or_raise(|| ErrorKind::InvalidData("sequence"))?,
            source_path: PathBuf::from(row.source_path),
            enqueued_at: super::timestamp(row.enqueued_at, "enqueue date")?,
            acknowledged: row.acknowledged,
            acknowledged_at: row.acknowledged_at.map(|at| super::timestamp(at, "acknowledgement date")).transpose()?,
            attempts: u32::try_from(row.attempts).or_raise(|| ErrorKind::InvalidData("attempts"))?,
            parked: row.parked,
        })
    }
}
