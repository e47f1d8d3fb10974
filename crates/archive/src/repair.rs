//! Sealing containers a crashed process left half-written.
//!
//! Everything up to the last complete entry is kept: a torn header or an entry
//! whose data runs past the end of the file is cut off, the end-of-archive
//! marker is written, and the container is sealed as if the builder had done
//! it.

use crate::error::{ErrorKind, Result};
use crate::model::{Container, ContainerInfo, Segment};
use crate::reader::digest_file;
use exn::ResultExt;
use std::fs::{File, OpenOptions};
use time::UtcDateTime;

const BLOCK: u64 = 512;
// Two zero blocks mark the end of a tar archive.
const TRAILER: u64 = 2 * BLOCK;

/// Seal what can be saved of an unsealed container file.
///
/// Returns `None` when the file is gone or holds no complete object.
pub fn repair(info: &ContainerInfo) -> Result<Option<Container>> {
    let file = match OpenOptions::new().read(true).write(true).open(&info.path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err).or_raise(|| ErrorKind::Io),
    };
    let length = file.metadata().or_raise(|| ErrorKind::Io)?.len();
    let (segments, end) = complete_entries(&file, length);
    if segments.is_empty() {
        return Ok(None);
    }
    tracing::debug!(container = %info.id, kept = end, cut = length.saturating_sub(end), "truncating container to its last complete entry");
    // Shrink first so the trailer is zeros whatever followed the last entry.
    file.set_len(end).or_raise(|| ErrorKind::Io)?;
    file.set_len(end + TRAILER).or_raise(|| ErrorKind::Io)?;
    file.sync_all().or_raise(|| ErrorKind::Io)?;
    drop(file);

    let (size, digest) = digest_file(&info.path)?;
    Ok(Some(Container {
        id: info.id.clone(),
        bucket: info.bucket.clone(),
        path: info.path.clone(),
        size,
        digest,
        segments,
        created_at: info.created_at,
        sealed_at: UtcDateTime::now(),
    }))
}

/// Objects whose header and data are entirely within the first `length`
/// bytes, and where the last of them ends.
fn complete_entries(file: &File, length: u64) -> (Vec<Segment>, u64) {
    let mut segments = Vec::new();
    let mut end = 0;
    let mut archive = tar::Archive::new(file);
    let Ok(entries) = archive.entries() else {
        return (segments, end);
    };
    for entry in entries {
        let Ok(entry) = entry else {
            break;
        };
        let offset = entry.raw_file_position();
        let size = entry.size();
        let entry_end = offset + size.div_ceil(BLOCK) * BLOCK;
        if entry_end > length {
            break;
        }
        if entry.header().entry_type() == tar::EntryType::Regular {
            let Ok(name) = entry.path() else {
                break;
            };
            segments.push(Segment { name: name.to_string_lossy().into_owned(), offset, size });
        }
        end = entry_end;
    }
    (segments, end)
}
