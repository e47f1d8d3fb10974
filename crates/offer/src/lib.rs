//! Tape storage offer.
//!
//! Objects written through [`BackupFileStorage`] are bundled into containers
//! on local disk. A sealed container moves to `READY_ON_DISK` and gets a
//! durable write order in the same step; a [`Listener`] per bucket drains
//! those orders onto tape through the device pool, and only acknowledges an
//! order once the container is recorded `ON_TAPE`. The [`RecoverySweep`]
//! closes the gap between the two durable writes, so that no sealed
//! container is ever left without an order.
//!
//! [`TapeOffer`] ties everything together and owns the background work.

mod cache;
mod creator;
pub mod error;
mod listener;
mod mount;
mod service;
mod storage;
mod sweep;

pub use crate::cache::{CachePin, ReadCache};
pub use crate::creator::WriteOrderCreator;
pub use crate::listener::{Delivery, Listener, ListenerSettings};
pub use crate::mount::ensure_loaded;
pub use crate::service::TapeOffer;
pub use crate::storage::{BackupFileStorage, ContainerRef, LocalCopy};
pub use crate::sweep::{BootstrapReport, RecoverySweep, SweepReport};
