//! Durable state of the tape offer.
//!
//! The referential database is the single source of truth for:
//! - **Containers**: identity, digest, segment table and lifecycle state
//!   (`BUILDING_ON_DISK` → `READY_ON_DISK` → `ON_TAPE`), changed only through
//!   compare-and-swap updates.
//! - **Write orders**: the write-ahead queue of containers waiting to be
//!   committed to tape, delivered FIFO per bucket and at least once.
//! - **Tapes**: how many files (and bytes) each cartridge holds, which is
//!   also where the next container on it will land.

mod catalog;
mod containers;
mod db;
pub mod error;
mod models;
mod queue;

pub use crate::catalog::TapeCatalog;
pub use crate::containers::ContainerRepository;
pub use crate::db::Database;
pub use crate::models::{
    ContainerEntry, ContainerState, NewWriteOrder, StateChange, TapeAddress, TapeRecord, TapeState, WriteOrder,
};
pub use crate::queue::WriteOrderQueue;
