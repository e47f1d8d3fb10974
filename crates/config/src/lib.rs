//! Configuration for the tape storage offer.
//!
//! Configuration is layered with `figment`: built-in defaults, then a TOML
//! (or YAML/JSON) file, then `REEL_`-prefixed environment variables. See
//! [`Config::load`] for the exact precedence.

pub mod error;
mod loader;
mod model;

pub use crate::loader::default_path;
pub use crate::model::{
    BucketConfig, Config, DriveConfig, LibraryConfig, ListenerConfig, StorageConfig, ToolsConfig,
};
