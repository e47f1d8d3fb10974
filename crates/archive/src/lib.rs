mod builder;
pub mod error;
mod model;
mod name;
mod reader;
mod repair;

pub use crate::builder::{AddOutcome, ContainerBuilder};
pub use crate::model::{Container, ContainerId, ContainerInfo, Segment};
pub use crate::name::validate as validate_name;
pub use crate::reader::{digest_file, index, read_object, read_segment, verify};
pub use crate::repair::repair;
