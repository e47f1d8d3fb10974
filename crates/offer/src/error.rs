//! Tape Offer Error Types
//!
//! Structured errors using `exn` for automatic location tracking and error
//! tree construction.
//!
//! Errors from the lower crates are classified on the way up: a missing
//! record or object becomes [`ErrorKind::NotFound`], a lost compare-and-swap
//! or an object name already in the open container becomes
//! [`ErrorKind::PreconditionFailed`], an exhausted device pool becomes
//! [`ErrorKind::Timeout`]. Everything else keeps its original kind, wrapped,
//! with the original error tree attached as a child frame.

use derive_more::{Display, Error};
use reel_archive::error::{Error as ArchiveError, ErrorKind as ArchiveErrorKind};
use reel_device::error::{Error as DeviceError, ErrorKind as DeviceErrorKind};
use reel_referential::error::{Error as ReferentialError, ErrorKind as ReferentialErrorKind};

/// A tape offer error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for tape offer operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
///
/// ### Caller errors
/// - [`ErrorKind::NotFound`]
/// - [`ErrorKind::PreconditionFailed`]
///
/// ### Transient (see [`is_retryable`](ErrorKind::is_retryable))
/// - [`ErrorKind::Timeout`]
/// - [`ErrorKind::TapeRejected`]
/// - some [`ErrorKind::Device`] and [`ErrorKind::Referential`] errors
///
/// ### Needs an operator
/// - [`ErrorKind::NoWritableTape`]
/// - [`ErrorKind::Internal`]
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    #[display("not found: {_0}")]
    NotFound(#[error(not(source))] String),
    /// The record wasn't in the expected state; someone else already acted on it.
    #[display("precondition failed: {_0}")]
    PreconditionFailed(#[error(not(source))] String),
    /// A resource (robot, drive) didn't become available in time.
    #[display("timed out: {_0}")]
    Timeout(#[error(not(source))] String),
    #[display("tape offer is shutting down")]
    ShuttingDown,
    /// A write failed part-way and the tape was set aside; another tape may work.
    #[display("write to tape {_0} failed, tape set aside")]
    TapeRejected(#[error(not(source))] String),
    /// Every tape assigned to the bucket is full or in conflict.
    #[display("no writable tape left for bucket {_0}")]
    NoWritableTape(#[error(not(source))] String),
    #[display("invalid configuration")]
    Config,
    #[display("device error: {_0}")]
    Device(DeviceErrorKind),
    #[display("referential error: {_0}")]
    Referential(ReferentialErrorKind),
    #[display("container error: {_0}")]
    Archive(ArchiveErrorKind),
    /// A bug, or a state that should be impossible.
    #[display("internal error: {_0}")]
    Internal(#[error(not(source))] String),
}

impl ErrorKind {
    /// Convert a device error, keeping the device crate's error tree as a child.
    #[track_caller]
    pub fn device(err: DeviceError) -> Error {
        let kind = match &*err {
            DeviceErrorKind::PoolExhausted(what) => Self::Timeout(format!("waiting for a {what}")),
            DeviceErrorKind::ShuttingDown | DeviceErrorKind::Cancelled(_) => Self::ShuttingDown,
            inner => Self::Device(inner.clone()),
        };
        err.raise(kind)
    }

    /// Convert a referential error, keeping the referential crate's error tree as a child.
    #[track_caller]
    pub fn referential(err: ReferentialError) -> Error {
        let kind = match &*err {
            ReferentialErrorKind::NotFound(what) => Self::NotFound(what.clone()),
            ReferentialErrorKind::PreconditionFailed { .. } => Self::PreconditionFailed((*err).to_string()),
            ReferentialErrorKind::Closed => Self::ShuttingDown,
            inner => Self::Referential(inner.clone()),
        };
        err.raise(kind)
    }

    /// Convert an archive error, keeping the archive crate's error tree as a child.
    #[track_caller]
    pub fn archive(err: ArchiveError) -> Error {
        let kind = match &*err {
            ArchiveErrorKind::ObjectNotFound(name) => Self::NotFound(format!("object {name}")),
            ArchiveErrorKind::DuplicateName(name) => {
                Self::PreconditionFailed(format!("object {name} is already in the open container"))
            },
            inner => Self::Archive(inner.clone()),
        };
        err.raise(kind)
    }

    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::TapeRejected(_) => true,
            Self::Device(kind) => kind.is_retryable(),
            Self::Referential(kind) => kind.is_retryable(),
            Self::Archive(kind) => kind.is_retryable(),
            _ => false,
        }
    }

    /// Whether the failure should be brought to an operator's attention right away.
    pub fn is_fatal(&self) -> bool {
        !self.is_retryable() && !matches!(self, Self::ShuttingDown | Self::PreconditionFailed(_))
    }
}
