//! Tracing subscriber setup.
//!
//! `RUST_LOG` wins over `--log-level` when it is set.

use crate::cli::LogFormat;
use crate::error::{ErrorKind, Result};
use exn::ResultExt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

pub fn init(level: &str, format: LogFormat) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(level)).or_raise(|| {
        ErrorKind::Usage(format!("log level {level:?}"))
    })?;
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Pretty => registry.with(fmt::layer().with_writer(std::io::stderr)).try_init(),
        LogFormat::Json => registry.with(fmt::layer().json().with_writer(std::io::stderr)).try_init(),
    }
    .or_raise(|| ErrorKind::Logging)
}
