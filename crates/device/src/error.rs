//! Device Error Types
//!
//! Structured errors using `exn` for automatic location tracking and error
//! tree construction.

use derive_more::{Display, Error};

// What drives and changers report while busy, or while settling after a
// cartridge move. Matched case-insensitively against stderr.
const TRANSIENT_CONDITIONS: [&str; 4] = ["device or resource busy", "not ready", "unit attention", "becoming ready"];

/// A device error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for device operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// The external program could not be started at all.
    #[display("could not start `{_0}`")]
    Spawn(#[error(not(source))] String),
    /// The external program ran but reported failure.
    #[display("`{program}` exited with code {}: {}", code.map_or_else(|| "none".to_string(), |c| c.to_string()), stderr.trim())]
    ExitStatus {
        program: String,
        /// `None` when the process was killed by a signal.
        code: Option<i32>,
        stderr: String,
    },
    /// The external program did not finish within its allotted time, and was killed.
    #[display("`{_0}` timed out")]
    Timeout(#[error(not(source))] String),
    /// The external program was terminated because the service is shutting down.
    #[display("`{_0}` terminated by shutdown")]
    Cancelled(#[error(not(source))] String),
    /// Tool output did not match any known line format.
    #[display("unparseable `{tool}` output: {line:?}")]
    Parse { tool: &'static str, line: String },
    /// No handle became available before the caller's deadline.
    #[display("timed out waiting for a {_0} handle")]
    PoolExhausted(#[error(not(source))] &'static str),
    /// A handle was returned to the pool without being checked out.
    #[display("{_0} was not checked out")]
    NotCheckedOut(#[error(not(source))] String),
    #[display("no drive with index {_0}")]
    UnknownDrive(#[error(not(source))] u32),
    #[display("drive index {_0} configured more than once")]
    DuplicateDrive(#[error(not(source))] u32),
    /// The pool is closed to new checkouts.
    #[display("device pool is shutting down")]
    ShuttingDown,
    #[display("I/O error")]
    Io,
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::PoolExhausted(_) => true,
            Self::ExitStatus { stderr, .. } => {
                let stderr = stderr.to_ascii_lowercase();
                TRANSIENT_CONDITIONS.iter().any(|condition| stderr.contains(condition))
            },
            _ => false,
        }
    }

    pub(crate) fn parse(tool: &'static str, line: impl Into<String>) -> Self {
        Self::Parse { tool, line: line.into() }
    }
}
