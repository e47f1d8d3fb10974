//! Read cache: containers read back from tape, bounded in bytes.
//!
//! Copies live at `<dir>/<bucket>/<id>.tar`. Staging a new copy first makes
//! room for it by evicting the least recently used copies nobody is reading.
//! A copy being staged or read is pinned and never evicted: when every copy is
//! pinned the cache goes over capacity for a while instead of failing the read.

use crate::error::{ErrorKind, Result};
use reel_archive::ContainerId;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

const COPY_EXTENSION: &str = "tar";
const PARTIAL_EXTENSION: &str = "partial";

struct Entry {
    size: u64,
    readers: usize,
    /// Staged and verified; a copy still being read back from tape is not.
    ready: bool,
}

#[derive(Default)]
struct State {
    entries: HashMap<PathBuf, Entry>,
    /// Least recently used first.
    lru: VecDeque<PathBuf>,
    used_bytes: u64,
}

impl State {
    fn touch(&mut self, path: &Path) {
        self.lru.retain(|other| other != path);
        self.lru.push_back(path.to_path_buf());
    }

    fn remove(&mut self, path: &Path) -> Option<Entry> {
        let entry = self.entries.remove(path)?;
        self.lru.retain(|other| other != path);
        self.used_bytes = self.used_bytes.saturating_sub(entry.size);
        Some(entry)
    }

    /// Drop idle copies, least recently used first, until `incoming` more bytes fit in `budget`.
    fn evict_for(&mut self, incoming: u64, budget: u64) -> Vec<PathBuf> {
        let mut evicted = Vec::new();
        let mut index = 0;
        while self.used_bytes.saturating_add(incoming) > budget && index < self.lru.len() {
            let idle = self.entries.get(&self.lru[index]).is_some_and(|entry| entry.ready && entry.readers == 0);
            if !idle {
                index += 1;
                continue;
            }
            if let Some(path) = self.lru.remove(index)
                && let Some(entry) = self.entries.remove(&path)
            {
                self.used_bytes = self.used_bytes.saturating_sub(entry.size);
                evicted.push(path);
            }
        }
        evicted
    }
}

/// Keeps one copy from being evicted for as long as it is alive.
pub struct CachePin {
    state: Arc<Mutex<State>>,
    path: PathBuf,
}

impl CachePin {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for CachePin {
    fn drop(&mut self) {
        if let Some(entry) = lock(&self.state).entries.get_mut(&self.path) {
            entry.readers = entry.readers.saturating_sub(1);
        }
    }
}

/// Cheap to clone; clones share the same index.
#[derive(Clone)]
pub struct ReadCache {
    dir: PathBuf,
    capacity: u64,
    state: Arc<Mutex<State>>,
}

impl ReadCache {
    pub fn new(dir: impl Into<PathBuf>, capacity: u64) -> Self {
        Self { dir: dir.into(), capacity, state: Arc::default() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Bytes held by the copies the cache knows about.
    pub fn used_bytes(&self) -> u64 {
        lock(&self.state).used_bytes
    }

    pub fn len(&self) -> usize {
        lock(&self.state).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Where the copy of a container is, or would be, staged.
    pub fn path_for(&self, bucket: &str, id: &ContainerId) -> PathBuf {
        self.dir.join(bucket).join(id.file_name())
    }

    /// Pin a staged copy, marking it most recently used.
    pub fn pin(&self, path: &Path) -> Option<CachePin> {
        let mut state = lock(&self.state);
        let entry = state.entries.get_mut(path).filter(|entry| entry.ready)?;
        entry.readers += 1;
        state.touch(path);
        Some(CachePin { state: self.state.clone(), path: path.to_path_buf() })
    }

    /// Make room for a copy of `size` bytes about to be staged at `path`, and pin it.
    ///
    /// The copy is not handed out by [`pin`](Self::pin) until it is
    /// [`complete`](Self::complete).
    pub async fn reserve(&self, path: &Path, size: u64) -> CachePin {
        let evicted = {
            let mut state = lock(&self.state);
            state.remove(path);
            let evicted = state.evict_for(size, self.capacity);
            state.entries.insert(path.to_path_buf(), Entry { size, readers: 1, ready: false });
            state.used_bytes = state.used_bytes.saturating_add(size);
            state.touch(path);
            if state.used_bytes > self.capacity {
                tracing::warn!(
                    used = state.used_bytes,
                    capacity = self.capacity,
                    "read cache over capacity, every other copy is in use"
                );
            }
            evicted
        };
        for path in &evicted {
            tracing::debug!(path = %path.display(), "evicting container copy from read cache");
            remove_file(path).await;
        }
        CachePin { state: self.state.clone(), path: path.to_path_buf() }
    }

    /// The copy at `path` is staged and verified, and weighs `size` bytes.
    pub fn complete(&self, path: &Path, size: u64) {
        let mut state = lock(&self.state);
        let Some(entry) = state.entries.get_mut(path) else {
            return;
        };
        let previous = std::mem::replace(&mut entry.size, size);
        entry.ready = true;
        state.used_bytes = state.used_bytes.saturating_sub(previous).saturating_add(size);
    }

    /// Drop a copy that failed staging or verification, and its file.
    pub async fn forget(&self, path: &Path) {
        lock(&self.state).remove(path);
        remove_file(path).await;
    }

    /// Index the copies a previous run left behind, oldest first, and delete
    /// its half-staged leftovers. Copies over capacity are evicted right away.
    pub async fn load(&self) -> Result<usize> {
        let mut found = Vec::new();
        let mut buckets = match tokio::fs::read_dir(&self.dir).await {
            Ok(buckets) => buckets,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(err) => exn::bail!(ErrorKind::Internal(format!("{}: {err}", self.dir.display()))),
        };
        while let Some(bucket) = buckets.next_entry().await.map_err(internal)? {
            if !bucket.file_type().await.map_err(internal)?.is_dir() {
                continue;
            }
            let mut files = tokio::fs::read_dir(bucket.path()).await.map_err(internal)?;
            while let Some(file) = files.next_entry().await.map_err(internal)? {
                let path = file.path();
                match path.extension().and_then(|extension| extension.to_str()) {
                    Some(PARTIAL_EXTENSION) => {
                        tracing::info!(path = %path.display(), "removing half-staged container copy");
                        remove_file(&path).await;
                    },
                    Some(COPY_EXTENSION) => {
                        let metadata = file.metadata().await.map_err(internal)?;
                        let modified = metadata.modified().unwrap_or(std::time::UNIX_EPOCH);
                        found.push((modified, path, metadata.len()));
                    },
                    _ => {},
                }
            }
        }
        found.sort();

        let count = found.len();
        let evicted = {
            let mut state = lock(&self.state);
            for (_, path, size) in found {
                state.remove(&path);
                state.entries.insert(path.clone(), Entry { size, readers: 0, ready: true });
                state.used_bytes = state.used_bytes.saturating_add(size);
                state.touch(&path);
            }
            state.evict_for(0, self.capacity)
        };
        for path in &evicted {
            remove_file(path).await;
        }
        tracing::info!(copies = count - evicted.len(), evicted = evicted.len(), "read cache loaded");
        Ok(count - evicted.len())
    }
}

fn lock(state: &Mutex<State>) -> MutexGuard<'_, State> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

fn internal(err: std::io::Error) -> ErrorKind {
    ErrorKind::Internal(err.to_string())
}

async fn remove_file(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {},
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {},
        Err(err) => tracing::warn!(path = %path.display(), error = %err, "could not remove cached copy"),
    }
}
