//! Tar/Container Builder.
//!
//! Objects are appended to one open container file per builder. The container
//! is sealed once its payload reaches the threshold (or on an explicit
//! [`seal`](ContainerBuilder::seal)): the tar trailer is written, the file is
//! synced, and the digest is computed by reading the file back from disk.
//!
//! Nothing about an open container is durable: a crash before sealing loses it.

use crate::error::{ErrorKind, Result};
use crate::model::{Container, ContainerId, ContainerInfo, Segment};
use crate::name;
use crate::reader::digest_file;
use exn::ResultExt;
use std::fs::{File, OpenOptions};
use std::io::Seek;
use std::path::{Path, PathBuf};
use time::UtcDateTime;

const BLOCK: u64 = 512;

struct OpenContainer {
    info: ContainerInfo,
    archive: tar::Builder<File>,
    segments: Vec<Segment>,
    payload: u64,
}

/// What happened to the builder's containers while adding one object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddOutcome {
    /// Container the object was written to.
    pub container_id: ContainerId,
    /// Set when the object started a new container.
    pub opened: Option<ContainerInfo>,
    /// Set when the object filled its container, which was then sealed.
    pub sealed: Option<Container>,
}

pub struct ContainerBuilder {
    bucket: String,
    dir: PathBuf,
    threshold: u64,
    open: Option<OpenContainer>,
}

impl ContainerBuilder {
    /// Containers will be written to `dir`, which is created if needed.
    pub fn new(bucket: impl Into<String>, dir: impl Into<PathBuf>, threshold: u64) -> Self {
        Self { bucket: bucket.into(), dir: dir.into(), threshold: threshold.max(1), open: None }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The container currently open for appends, if any.
    pub fn current(&self) -> Option<&ContainerInfo> {
        self.open.as_ref().map(|open| &open.info)
    }

    /// Append one object, opening a container first if none is open, and
    /// sealing it afterwards if the threshold is reached.
    ///
    /// A name already in the open container is refused, leaving the container
    /// as it was. On any other failure the open container is abandoned and its
    /// file removed.
    pub fn add_object(&mut self, name: &str, bytes: &[u8]) -> Result<AddOutcome> {
        let name = name::validate(name)?;
        if let Some(open) = &self.open
            && open.segments.iter().any(|segment| segment.name == name)
        {
            exn::bail!(ErrorKind::DuplicateName(name));
        }
        let opened = match self.open {
            Some(_) => None,
            None => Some(self.open_container()?),
        };
        let Some(open) = self.open.as_mut() else {
            exn::bail!(ErrorKind::Io);
        };
        if let Err(err) = append(open, &name, bytes) {
            self.abandon();
            return Err(err);
        }
        let container_id = open.info.id.clone();
        tracing::trace!(container = %container_id, object = %name, size = bytes.len(), "object appended");
        let sealed = match open.payload >= self.threshold {
            true => self.seal()?,
            false => None,
        };
        Ok(AddOutcome { container_id, opened, sealed })
    }

    /// Seal the open container, if there is one.
    pub fn seal(&mut self) -> Result<Option<Container>> {
        let Some(open) = self.open.take() else {
            return Ok(None);
        };
        let path = open.info.path.clone();
        match finish(open) {
            Ok(container) => {
                tracing::info!(
                    container = %container.id,
                    bucket = %container.bucket,
                    objects = container.segments.len(),
                    size = container.size,
                    "container sealed"
                );
                Ok(Some(container))
            },
            Err(err) => {
                remove_file(&path);
                Err(err)
            },
        }
    }

    /// Drop the open container and delete its file.
    pub fn abandon(&mut self) -> Option<ContainerId> {
        let open = self.open.take()?;
        tracing::warn!(container = %open.info.id, "abandoning open container");
        let OpenContainer { info, archive, .. } = open;
        drop(archive);
        remove_file(&info.path);
        Some(info.id)
    }

    fn open_container(&mut self) -> Result<ContainerInfo> {
        std::fs::create_dir_all(&self.dir).or_raise(|| ErrorKind::Io)?;
        let id = ContainerId::generate();
        let path = self.dir.join(id.file_name());
        let file = OpenOptions::new().write(true).create_new(true).open(&path).or_raise(|| ErrorKind::Io)?;
        let archive = tar::Builder::new(file);
        let info = ContainerInfo { id, bucket: self.bucket.clone(), path, created_at: UtcDateTime::now() };
        tracing::debug!(container = %info.id, bucket = %self.bucket, "container opened");
        self.open = Some(OpenContainer { info: info.clone(), archive, segments: Vec::new(), payload: 0 });
        Ok(info)
    }
}

fn append(open: &mut OpenContainer, name: &str, bytes: &[u8]) -> Result<()> {
    let size = bytes.len() as u64;
    let mut header = tar::Header::new_gnu();
    header.set_size(size);
    header.set_mode(0o644);
    header.set_mtime(open.info.created_at.unix_timestamp().max(0) as u64);
    header.set_entry_type(tar::EntryType::Regular);
    open.archive.append_data(&mut header, name, bytes).or_raise(|| ErrorKind::Io)?;
    // The builder writes straight to the file: the cursor sits right after this entry's padding.
    let end = open.archive.get_mut().stream_position().or_raise(|| ErrorKind::Io)?;
    let offset = end - size.div_ceil(BLOCK) * BLOCK;
    open.segments.push(Segment { name: name.to_string(), offset, size });
    open.payload += size;
    Ok(())
}

fn finish(open: OpenContainer) -> Result<Container> {
    let OpenContainer { info, archive, segments, .. } = open;
    let file = archive.into_inner().or_raise(|| ErrorKind::Io)?;
    file.sync_all().or_raise(|| ErrorKind::Io)?;
    drop(file);
    // Hash what actually landed on disk, not what we think we wrote.
    let (size, digest) = digest_file(&info.path)?;
    Ok(Container {
        id: info.id,
        bucket: info.bucket,
        path: info.path,
        size,
        digest,
        segments,
        created_at: info.created_at,
        sealed_at: UtcDateTime::now(),
    })
}

fn remove_file(path: &Path) {
    if let Err(err) = std::fs::remove_file(path)
        && err.kind() != std::io::ErrorKind::NotFound
    {
        tracing::error!(path = %path.display(), error = %err, "could not remove container file");
    }
}
