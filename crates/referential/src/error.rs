//! Referential Error Types
//!
//! Structured errors using `exn` for automatic location tracking and error
//! tree construction.

use derive_more::{Display, Error};

/// A referential error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for referential operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    #[display("database error")]
    Database,
    #[display("database migration error")]
    Migration,
    #[display("not found: {_0}")]
    NotFound(#[error(not(source))] String),
    /// A record with the same key already exists.
    #[display("already exists: {_0}")]
    AlreadyExists(#[error(not(source))] String),
    /// The stored state didn't match the expected one; someone else got there first.
    #[display("precondition failed for {id}: expected {expected}, found {actual}")]
    PreconditionFailed { id: String, expected: String, actual: String },
    /// Lifecycle states only move forward, one step at a time.
    #[display("invalid transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },
    /// The container already has an outstanding write order.
    #[display("container already queued: {_0}")]
    AlreadyQueued(#[error(not(source))] String),
    /// The queue has been closed for shutdown.
    #[display("write-order queue closed")]
    Closed,
    /// Stored data couldn't be converted to or from its model.
    #[display("invalid referential data: {_0}")]
    InvalidData(#[error(not(source))] &'static str),
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        // SQLITE_BUSY and friends surface as plain database errors.
        matches!(self, Self::Database)
    }
}

pub(crate) fn map_constraint(err: sqlx::Error, key: &str, unique: ErrorKind) -> Error {
    let kind = match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => unique,
        sqlx::Error::Database(db) if db.is_foreign_key_violation() => ErrorKind::NotFound(key.to_string()),
        _ => ErrorKind::Database,
    };
    exn::Exn::from(err).raise(kind)
}
