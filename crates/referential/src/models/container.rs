use crate::error::{Error, ErrorKind};
use derive_more::Display;
use exn::ResultExt;
use reel_archive::{Container, ContainerId, ContainerInfo, Segment};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use time::UtcDateTime;

/// Lifecycle of a container. Ordered: a state only ever moves to the next one.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ContainerState {
    /// Open for appends on local disk; nothing about it is durable yet.
    #[display("BUILDING_ON_DISK")]
    BuildingOnDisk,
    /// Sealed, digested, and waiting in the write-order queue.
    #[display("READY_ON_DISK")]
    ReadyOnDisk,
    /// Written to a known position on a known tape.
    #[display("ON_TAPE")]
    OnTape,
}
impl ContainerState {
    pub fn next(self) -> Option<Self> {
        match self {
            Self::BuildingOnDisk => Some(Self::ReadyOnDisk),
            Self::ReadyOnDisk => Some(Self::OnTape),
            Self::OnTape => None,
        }
    }
}
impl FromStr for ContainerState {
    type Err = ErrorKind;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "BUILDING_ON_DISK" => Ok(Self::BuildingOnDisk),
            "READY_ON_DISK" => Ok(Self::ReadyOnDisk),
            "ON_TAPE" => Ok(Self::OnTape),
            _ => Err(ErrorKind::InvalidData("container state")),
        }
    }
}

/// Where a container was written: the `file`-th file mark on tape `label`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TapeAddress {
    pub label: String,
    pub file: u64,
}
impl fmt::Display for TapeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.label, self.file)
    }
}

/// The data that comes with moving a container into a new state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateChange {
    Sealed(Container),
    Written(TapeAddress),
}
impl StateChange {
    /// The state this change moves a container into.
    pub fn state(&self) -> ContainerState {
        match self {
            Self::Sealed(_) => ContainerState::ReadyOnDisk,
            Self::Written(_) => ContainerState::OnTape,
        }
    }
}

/// A container as recorded in the referential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerEntry {
    pub id: ContainerId,
    pub bucket: String,
    pub state: ContainerState,
    /// Local container file; may no longer exist once the container is on tape.
    pub path: PathBuf,
    pub size: Option<u64>,
    pub digest: Option<String>,
    pub segments: Vec<Segment>,
    pub tape: Option<TapeAddress>,
    pub created_at: UtcDateTime,
    pub sealed_at: Option<UtcDateTime>,
    pub written_at: Option<UtcDateTime>,
}
impl ContainerEntry {
    pub fn building(info: &ContainerInfo) -> Self {
        Self {
            id: info.id.clone(),
            bucket: info.bucket.clone(),
            state: ContainerState::BuildingOnDisk,
            path: info.path.clone(),
            size: None,
            digest: None,
            segments: Vec::new(),
            tape: None,
            created_at: info.created_at,
            sealed_at: None,
            written_at: None,
        }
    }

    pub fn ready(container: &Container) -> Self {
        Self {
            id: container.id.clone(),
            bucket: container.bucket.clone(),
            state: ContainerState::ReadyOnDisk,
            path: container.path.clone(),
            size: Some(container.size),
            digest: Some(container.digest.clone()),
            segments: container.segments.clone(),
            tape: None,
            created_at: container.created_at,
            sealed_at: Some(container.sealed_at),
            written_at: None,
        }
    }

    /// The sealed container descriptor, if the container has been sealed.
    pub fn container(&self) -> Option<Container> {
        Some(Container {
            id: self.id.clone(),
            bucket: self.bucket.clone(),
            path: self.path.clone(),
            size: self.size?,
            digest: self.digest.clone()?,
            segments: self.segments.clone(),
            created_at: self.created_at,
            sealed_at: self.sealed_at?,
        })
    }
}

#[derive(sqlx::FromRow)]
pub(crate) struct ContainerRow {
    pub(crate) id: String,
    pub(crate) bucket: String,
    pub(crate) state: String,
    pub(crate) source_path: String,
    pub(crate) size: Option<i64>,
    pub(crate) digest: Option<String>,
    pub(crate) segments: String,
    pub(crate) tape_label: Option<String>,
    pub(crate) tape_file: Option<i64>,
    pub(crate) created_at: i64,
    pub(crate) sealed_at: Option<i64>,
    pub(crate) written_at: Option<i64>,
}
impl TryFrom<&ContainerEntry> for ContainerRow {
    type Error = Error;
    fn try_from(entry: &ContainerEntry) -> Result<Self, Self::Error> {
        Ok(Self {
            id: entry.id.to_string(),
            bucket: entry.bucket.clone(),
            state: entry.state.to_string(),
            source_path: super::path_to_string(&entry.path)?,
            size: entry.size.map(i64::try_from).transpose().or_raise(|| ErrorKind::InvalidData("size"))?,
            digest: entry.digest.clone(),
            segments: serde_json::to_string(&entry.segments).or_raise(|| ErrorKind::InvalidData("segments"))?,
            tape_label: entry.tape.as_ref().map(|tape| tape.label.clone()),
            tape_file: entry
                .tape
                .as_ref()
                .map(|tape| i64::try_from(tape.file))
                .transpose()
                .or_raise(|| ErrorKind::InvalidData("tape file"))?,
            created_at: entry.created_at.unix_timestamp(),
            sealed_at: entry.sealed_at.map(UtcDateTime::unix_timestamp),
            written_at: entry.written_at.map(UtcDateTime::unix_timestamp),
        })
    }
}
impl TryFrom<ContainerRow> for ContainerEntry {
    type Error = Error;
    fn try_from(row: ContainerRow) -> Result<Self, Self::Error> {
        let tape = match (row.tape_label, row.tape_file) {
            (Some(label), Some(file)) => Some(TapeAddress {
                label,
                file: u64::try_from(file).or_raise(|| ErrorKind::InvalidData("tape file"))?,
            }),
            _ => None,
        };
        Ok(Self {
            id: row.id.parse::<ContainerId>().or_raise(|| ErrorKind::InvalidData("container id"))?,
            bucket: row.bucket,
            state: row.state.parse::<ContainerState>()?,
            path: PathBuf::from(row.source_path),
            size: row.size.map(u64::try_from).transpose().or_raise(|| ErrorKind::InvalidData("size"))?,
            digest: row.digest,
            segments: serde_json::from_str(&row.segments).or_raise(|| ErrorKind::InvalidData("segments"))?,
            tape,
            created_at: super::timestamp(row.created_at, "creation date")?,
            sealed_at: row.sealed_at.map(|at| super::timestamp(at, "seal date")).transpose()?,
            written_at: row.written_at.map(|at| super::timestamp(at, "write date")).transpose()?,
        })
    }
}
