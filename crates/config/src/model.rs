//! Configuration model.
//!
//! Every section has defaults so that a configuration file only needs to
//! describe what differs from them (usually the library and the buckets).
//! Durations are expressed in whole seconds or milliseconds, with the unit in
//! the field name, because that's what is easiest to write in environment
//! variables.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// 1 GiB of payload before a container is sealed.
const DEFAULT_CONTAINER_THRESHOLD: u64 = 1 << 30;
/// LTO-6 native capacity is 2.5TB; assume the cartridge is full after 90%.
const DEFAULT_FULL_CARTRIDGE_THRESHOLD: u64 = 2_250_000_000_000;
const DEFAULT_BLOCK_SIZE: u64 = 256 * 1024;
/// 64 GiB of containers read back from tape.
const DEFAULT_READ_CACHE_CAPACITY: u64 = 64 << 30;

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub tools: ToolsConfig,
    pub library: LibraryConfig,
    /// Bucket topology: logical partitions and the physical tapes that back them.
    pub buckets: BTreeMap<String, BucketConfig>,
    pub listener: ListenerConfig,
}
impl Config {
    pub fn bucket(&self, name: &str) -> Option<&BucketConfig> {
        self.buckets.get(name)
    }

    pub fn drive(&self, index: u32) -> Option<&DriveConfig> {
        self.library.drives.iter().find(|drive| drive.index == index)
    }
}

/// Local disk layout.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Containers are built (and wait for tape) under `{input_dir}/{bucket}/`.
    pub input_dir: PathBuf,
    /// Containers read back from tape are staged under `{read_cache_dir}/{bucket}/`.
    pub read_cache_dir: PathBuf,
    /// Bytes the read cache may hold. Copies nobody is reading are evicted,
    /// least recently used first, to make room for a new one.
    pub read_cache_capacity: u64,
    /// SQLite database holding the referential, the write-order queue and the tape catalog.
    pub database: PathBuf,
    /// Payload bytes accumulated in a container before it is sealed.
    pub container_threshold: u64,
    /// Delete the local copy of a container once it is on tape.
    pub purge_after_write: bool,
}
impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            input_dir: PathBuf::from("/var/lib/reel/input"),
            read_cache_dir: PathBuf::from("/var/lib/reel/cache"),
            read_cache_capacity: DEFAULT_READ_CACHE_CAPACITY,
            database: PathBuf::from("/var/lib/reel/referential.db"),
            container_threshold: DEFAULT_CONTAINER_THRESHOLD,
            purge_after_write: true,
        }
    }
}

/// External command-line tools used to talk to the hardware.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ToolsConfig {
    /// Drive control (status, rewind, eject, position).
    pub mt: PathBuf,
    /// Robot/changer control (status, load, unload).
    pub mtx: PathBuf,
    /// Streaming data transfer to and from a drive.
    pub dd: PathBuf,
    pub command_timeout_secs: u64,
    pub transfer_timeout_secs: u64,
    /// How long an in-flight command may keep running after shutdown was requested.
    pub shutdown_grace_secs: u64,
    pub block_size: u64,
}
impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            mt: PathBuf::from("mt"),
            mtx: PathBuf::from("mtx"),
            dd: PathBuf::from("dd"),
            command_timeout_secs: 300,
            transfer_timeout_secs: 4 * 60 * 60,
            shutdown_grace_secs: 120,
            block_size: DEFAULT_BLOCK_SIZE,
        }
    }
}
impl ToolsConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_secs(self.transfer_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct LibraryConfig {
    /// Changer devices, one robot handle each.
    pub robots: Vec<PathBuf>,
    pub drives: Vec<DriveConfig>,
    /// Written bytes above which a failed write is treated as end-of-tape
    /// rather than a corrupted cartridge.
    pub full_cartridge_threshold: u64,
}
impl Default for LibraryConfig {
    fn default() -> Self {
        Self {
            robots: Vec::new(),
            drives: Vec::new(),
            full_cartridge_threshold: DEFAULT_FULL_CARTRIDGE_THRESHOLD,
        }
    }
}

/// A physical drive. The index is the changer's data transfer element number,
/// which is how the robot addresses the drive.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct DriveConfig {
    pub index: u32,
    /// Non-rewinding device node, e.g. `/dev/nst0`.
    pub device: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct BucketConfig {
    /// Drive dedicated to writing this bucket's containers.
    pub drive: u32,
    /// Volume tags of the cartridges assigned to this bucket, in fill order.
    pub tapes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Upper bound on a single blocking poll of the write-order queue.
    pub poll_wait_ms: u64,
    pub robot_checkout_timeout_secs: u64,
    /// Attempts at a single write order before it is parked for an operator.
    pub max_attempts: u32,
    /// Base delay between attempts; doubled after each failure.
    pub retry_backoff_ms: u64,
    pub sweep_interval_secs: u64,
}
impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            poll_wait_ms: 5_000,
            robot_checkout_timeout_secs: 600,
            max_attempts: 3,
            retry_backoff_ms: 10_000,
            sweep_interval_secs: 300,
        }
    }
}
impl ListenerConfig {
    pub fn poll_wait(&self) -> Duration {
        Duration::from_millis(self.poll_wait_ms)
    }

    pub fn robot_checkout_timeout(&self) -> Duration {
        Duration::from_secs(self.robot_checkout_timeout_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}
