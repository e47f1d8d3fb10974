use crate::error::{Error, ErrorKind};
use derive_more::Display;
use exn::ResultExt;
use std::str::FromStr;
use time::UtcDateTime;

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TapeState {
    /// Never written to.
    #[display("EMPTY")]
    Empty,
    /// Has files; more can be appended.
    #[display("OPEN")]
    Open,
    /// Hit end of tape.
    #[display("FULL")]
    Full,
    /// Its contents no longer match the catalog; needs an operator.
    #[display("CONFLICT")]
    Conflict,
}
impl TapeState {
    pub fn is_writable(self) -> bool {
        matches!(self, Self::Empty | Self::Open)
    }
}
impl FromStr for TapeState {
    type Err = ErrorKind;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "EMPTY" => Ok(Self::Empty),
            "OPEN" => Ok(Self::Open),
            "FULL" => Ok(Self::Full),
            "CONFLICT" => Ok(Self::Conflict),
            _ => Err(ErrorKind::InvalidData("tape state")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TapeRecord {
    /// Volume tag (barcode) of the cartridge.
    pub label: String,
    pub bucket: String,
    pub state: TapeState,
    /// Files written so far; also the position of the next one.
    pub file_count: u64,
    pub written_bytes: u64,
    pub updated_at: UtcDateTime,
}

#[derive(sqlx::FromRow)]
pub(crate) struct TapeRow {
    label: String,
    bucket: String,
    state: String,
    file_count: i64,
    written_bytes: i64,
    updated_at: i64,
}
impl TryFrom<TapeRow> for TapeRecord {
    type Error = Error;
    fn try_from(row: TapeRow) -> Result<Self, Self::Error> {
        Ok(Self {
            label: row.label,
            bucket: row.bucket,
            state: row.state.parse::<TapeState>()?,
            file_count: u64::try_from(row.file_count).or_raise(|| ErrorKind::InvalidData("file count"))?,
            written_bytes: u64::try_from(row.written_bytes).or_raise(|| ErrorKind::InvalidData("written bytes"))?,
            updated_at: super::timestamp(row.updated_at, "update date")?,
        })
    }
}
