use crate::error::{ErrorKind, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use time::UtcDateTime;
use uuid::Uuid;

/// Generated container identifier: a UUIDv4 in its 32 character hex form.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContainerId(String);
impl ContainerId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Name of the container file on local disk.
    pub fn file_name(&self) -> String {
        format!("{}.tar", self.0)
    }
}
impl FromStr for ContainerId {
    type Err = crate::error::Error;
    fn from_str(s: &str) -> Result<Self> {
        match Uuid::try_parse(s) {
            Ok(uuid) => Ok(Self(uuid.simple().to_string())),
            Err(_) => exn::bail!(ErrorKind::InvalidId(s.to_string())),
        }
    }
}
impl TryFrom<String> for ContainerId {
    type Error = ErrorKind;
    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        match Uuid::try_parse(&value) {
            Ok(uuid) => Ok(Self(uuid.simple().to_string())),
            Err(_) => Err(ErrorKind::InvalidId(value)),
        }
    }
}
impl From<ContainerId> for String {
    fn from(id: ContainerId) -> Self {
        id.0
    }
}
impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where one logical object lives inside a container: `size` bytes starting at `offset`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    pub name: String,
    pub offset: u64,
    pub size: u64,
}

/// A container that is open for appends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInfo {
    pub id: ContainerId,
    pub bucket: String,
    pub path: PathBuf,
    pub created_at: UtcDateTime,
}

/// A sealed container. Its bytes never change after sealing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Container {
    pub id: ContainerId,
    pub bucket: String,
    pub path: PathBuf,
    /// Size of the whole container file, tar framing included.
    pub size: u64,
    /// BLAKE3 of the whole container file, hex encoded.
    pub digest: String,
    pub segments: Vec<Segment>,
    pub created_at: UtcDateTime,
    pub sealed_at: UtcDateTime,
}
impl Container {
    /// The object stored under `name`. If a tar written elsewhere holds the
    /// name more than once, the last entry wins, as it does on extraction.
    pub fn segment(&self, name: &str) -> Option<&Segment> {
        self.segments.iter().rev().find(|segment| segment.name == name)
    }

    /// Sum of the object sizes, without tar framing.
    pub fn payload(&self) -> u64 {
        self.segments.iter().map(|segment| segment.size).sum()
    }
}
