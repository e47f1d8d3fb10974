//! Pure parsers from tool output to status records.
//!
//! Unknown lines are never skipped: anything that doesn't match a known
//! format is reported as [`ErrorKind::Parse`](crate::error::ErrorKind::Parse)
//! with the offending line.

macro_rules! regex {
    ($name:ident, $regex:expr) => {
        static $name: std::sync::LazyLock<regex::Regex> =
            std::sync::LazyLock::new(|| regex::Regex::new($regex).unwrap());
    };
}

mod drive;
mod library;
mod transfer;

pub use self::drive::{DriveFlag, DriveStatus, parse_drive_status};
pub use self::library::{Cartridge, DriveSlot, LibraryStatus, StorageSlot, TapeLocation, parse_library_status};
pub use self::transfer::{Records, TransferSummary, parse_transfer_summary};
