//! Archive Error Types
//!
//! Structured errors using `exn` for automatic location tracking and error
//! tree construction.

use derive_more::{Display, Error};

/// An archive error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for archive operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// Reading or writing a container file failed.
    #[display("container I/O error")]
    Io,
    /// Object names become tar entry paths; they must stay relative.
    #[display("invalid object name: {_0:?}")]
    InvalidName(#[error(not(source))] String),
    /// The open container already holds an object with this name.
    #[display("object already in container: {_0}")]
    DuplicateName(#[error(not(source))] String),
    #[display("invalid container id: {_0:?}")]
    InvalidId(#[error(not(source))] String),
    /// The requested object isn't part of the container.
    #[display("object not found in container: {_0}")]
    ObjectNotFound(#[error(not(source))] String),
    /// The container's bytes don't hash to the recorded digest.
    #[display("digest mismatch: expected {expected}, found {actual}")]
    DigestMismatch { expected: String, actual: String },
    /// The file isn't a readable tar archive.
    #[display("malformed container: {_0}")]
    Malformed(#[error(not(source))] String),
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Io)
    }
}
