//! Command-line Error Types

use derive_more::{Display, Error};

pub type Error = exn::Exn<ErrorKind>;
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    #[display("could not load configuration")]
    Config,
    #[display("could not set up logging")]
    Logging,
    #[display("invalid argument: {_0}")]
    Usage(#[error(not(source))] String),
    #[display("could not access {_0}")]
    Io(#[error(not(source))] String),
    #[display("tape offer operation failed")]
    Offer,
}
