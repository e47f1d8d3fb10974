//! Reading sealed containers back.

use crate::error::{ErrorKind, Result};
use crate::model::{Container, Segment};
use exn::ResultExt;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

/// Size and hex BLAKE3 digest of a file.
pub fn digest_file(path: &Path) -> Result<(u64, String)> {
    let mut file = File::open(path).or_raise(|| ErrorKind::Io)?;
    let mut hasher = blake3::Hasher::new();
    let size = std::io::copy(&mut file, &mut hasher).or_raise(|| ErrorKind::Io)?;
    Ok((size, hasher.finalize().to_hex().to_string()))
}

/// Check that the file at `path` still has the digest recorded at sealing.
pub fn verify(path: &Path, expected: &str) -> Result<u64> {
    let (size, actual) = digest_file(path)?;
    if actual != expected {
        exn::bail!(ErrorKind::DigestMismatch { expected: expected.to_string(), actual });
    }
    Ok(size)
}

/// Read one object's bytes out of a container file.
pub fn read_segment(path: &Path, segment: &Segment) -> Result<Vec<u8>> {
    let mut file = File::open(path).or_raise(|| ErrorKind::Io)?;
    let length = file.metadata().or_raise(|| ErrorKind::Io)?.len();
    if segment.offset.saturating_add(segment.size) > length {
        exn::bail!(ErrorKind::Malformed(format!(
            "segment {} ({}+{}) runs past the end of {}",
            segment.name,
            segment.offset,
            segment.size,
            path.display()
        )));
    }
    file.seek(SeekFrom::Start(segment.offset)).or_raise(|| ErrorKind::Io)?;
    let mut bytes = Vec::with_capacity(segment.size as usize);
    file.take(segment.size).read_to_end(&mut bytes).or_raise(|| ErrorKind::Io)?;
    Ok(bytes)
}

/// Read an object by name from a sealed container.
pub fn read_object(container: &Container, name: &str) -> Result<Vec<u8>> {
    let name = crate::name::validate(name)?;
    let Some(segment) = container.segment(&name) else {
        exn::bail!(ErrorKind::ObjectNotFound(name));
    };
    read_segment(&container.path, segment)
}

/// Rebuild the segment list of a container from its tar headers.
///
/// Used when a container's metadata has to be recovered from the file alone.
pub fn index(path: &Path) -> Result<Vec<Segment>> {
    let file = File::open(path).or_raise(|| ErrorKind::Io)?;
    let mut archive = tar::Archive::new(file);
    let mut segments = Vec::new();
    for entry in archive.entries().or_raise(|| ErrorKind::Malformed(path.display().to_string()))? {
        let entry = entry.or_raise(|| ErrorKind::Malformed(path.display().to_string()))?;
        if entry.header().entry_type() != tar::EntryType::Regular {
            continue;
        }
        let name = entry.path().or_raise(|| ErrorKind::Malformed(path.display().to_string()))?;
        segments.push(Segment {
            name: name.to_string_lossy().into_owned(),
            offset: entry.raw_file_position(),
            size: entry.size(),
        });
    }
    Ok(segments)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::ContainerBuilder;

    fn sealed(dir: &Path) -> Container {
        let mut builder = ContainerBuilder::new("backup", dir, 1 << 20);
        builder.add_object("a", b"alpha").unwrap();
        builder.add_object("nested/b", b"bravo").unwrap();
        builder.seal().unwrap().unwrap()
    }

    #[test]
    fn test_read_object_by_name() {
        let dir = tempfile::tempdir().unwrap();
        let container = sealed(dir.path());
        assert_eq!(read_object(&container, "nested/b").unwrap(), b"bravo");
        assert_eq!(read_object(&container, "./a").unwrap(), b"alpha");
        let err = read_object(&container, "c").unwrap_err();
        assert!(matches!(&*err, ErrorKind::ObjectNotFound(name) if name == "c"));
    }

    #[test]
    fn test_verify_detects_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let container = sealed(dir.path());
        assert_eq!(verify(&container.path, &container.digest).unwrap(), container.size);

        let mut bytes = std::fs::read(&container.path).unwrap();
        let offset = container.segment("a").unwrap().offset as usize;
        bytes[offset] ^= 0xff;
        std::fs::write(&container.path, bytes).unwrap();

        let err = verify(&container.path, &container.digest).unwrap_err();
        assert!(matches!(&*err, ErrorKind::DigestMismatch { expected, .. } if *expected == container.digest));
    }

    #[test]
    fn test_segment_past_end_is_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let container = sealed(dir.path());
        let bogus = Segment { name: "bogus".into(), offset: container.size - 2, size: 10 };
        let err = read_segment(&container.path, &bogus).unwrap_err();
        assert!(matches!(&*err, ErrorKind::Malformed(_)));
    }

    #[test]
    fn test_index_of_non_tar_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("junk.tar");
        std::fs::write(&path, vec![0x5a; 1024]).unwrap();
        assert!(index(&path).is_err());
    }

    #[test]
    fn test_repeated_name_reads_the_last_entry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("foreign.tar");
        let mut archive = tar::Builder::new(File::create(&path).unwrap());
        for bytes in [&b"old"[..], &b"new"[..]] {
            let mut header = tar::Header::new_gnu();
            header.set_size(bytes.len() as u64);
            header.set_mode(0o644);
            archive.append_data(&mut header, "a", bytes).unwrap();
        }
        archive.finish().unwrap();
        drop(archive);

        let (size, digest) = digest_file(&path).unwrap();
        let now = time::UtcDateTime::now();
        let container = Container {
            id: crate::ContainerId::generate(),
            bucket: "backup".into(),
            path,
            size,
            digest,
            segments: index(&dir.path().join("foreign.tar")).unwrap(),
            created_at: now,
            sealed_at: now,
        };
        assert_eq!(container.segments.len(), 2);
        assert_eq!(read_object(&container, "a").unwrap(), b"new");
    }
}
