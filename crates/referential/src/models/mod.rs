mod container;
mod order;
mod tape;

pub use self::container::{ContainerEntry, ContainerState, StateChange, TapeAddress};
pub(crate) use self::container::ContainerRow;
pub use self::order::{NewWriteOrder, WriteOrder};
pub(crate) use self::order::WriteOrderRow;
pub(crate) use self::tape::TapeRow;
pub use self::tape::{TapeRecord, TapeState};
use crate::error::{ErrorKind, Result};
use exn::{OptionExt, ResultExt};
use std::path::Path;
use time::UtcDateTime;

/// sqlx can't bind paths, and a lossy conversion would point at the wrong file.
pub(crate) fn path_to_string(path: &Path) -> Result<String> {
    Ok(path.to_str().ok_or_raise(|| ErrorKind::InvalidData("path"))?.to_string())
}

pub(crate) fn timestamp(seconds: i64, what: &'static str) -> Result<UtcDateTime> {
    UtcDateTime::from_unix_timestamp(seconds).or_raise(|| ErrorKind::InvalidData(what))
}
