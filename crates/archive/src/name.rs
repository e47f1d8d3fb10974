//! Object name validation.
//!
//! Object names are written as tar entry paths, and may be extracted by an
//! operator with plain `tar` one day. They must stay relative and must not
//! climb out of the extraction directory.

use crate::error::{ErrorKind, Result};
use std::path::{Component, Path};

/// Validate and normalize an object name.
///
/// ```
/// use reel_archive::validate_name;
/// assert_eq!(validate_name("unit/./objects//abc").unwrap(), "unit/objects/abc");
/// assert!(validate_name("../etc/passwd").is_err());
/// ```
pub fn validate(name: &str) -> Result<String> {
    if name.contains('\0') {
        exn::bail!(ErrorKind::InvalidName(name.to_string()));
    }
    let mut components = Vec::new();
    for component in Path::new(name).components() {
        match component {
            Component::Normal(part) => match part.to_str() {
                Some(part) => components.push(part),
                None => exn::bail!(ErrorKind::InvalidName(name.to_string())),
            },
            Component::CurDir => {},
            // Absolute names would extract over the host's own files.
            Component::RootDir | Component::Prefix(_) => exn::bail!(ErrorKind::InvalidName(name.to_string())),
            Component::ParentDir => {
                if components.pop().is_none() {
                    exn::bail!(ErrorKind::InvalidName(name.to_string()));
                }
            },
        }
    }
    if components.is_empty() {
        exn::bail!(ErrorKind::InvalidName(name.to_string()));
    }
    Ok(components.join("/"))
}
