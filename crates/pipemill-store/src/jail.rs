//! Path-jail resolution for user-supplied filenames.
//!
//! Every file read or write below a job directory resolves through here.
//! Violations are `Forbidden`, never `NotFound`, so a probe cannot learn
//! which paths exist outside the jail.

use std::path::{Component, Path, PathBuf};

use pipemill_core::{Error, Result};

/// Resolve a user-supplied relative filename inside `jail_root`.
///
/// Rejects absolute paths, drive-letter paths, and any path whose
/// normalization escapes the jail. `.` segments are dropped; `..` segments
/// are allowed only while they stay inside the jail.
pub fn resolve(jail_root: &Path, filename: &str) -> Result<PathBuf> {
    if filename.is_empty() {
        return Err(Error::validation("filename is required"));
    }
    if has_drive_letter(filename) {
        return Err(Error::forbidden("Absolute paths not allowed"));
    }

    let candidate = Path::new(filename);
    if candidate.is_absolute() {
        return Err(Error::forbidden("Absolute paths not allowed"));
    }

    let mut stack: Vec<&std::ffi::OsStr> = Vec::new();
    for component in candidate.components() {
        match component {
            Component::Normal(part) => stack.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                if stack.pop().is_none() {
                    return Err(Error::forbidden("Path traversal"));
                }
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(Error::forbidden("Absolute paths not allowed"));
            }
        }
    }
    if stack.is_empty() {
        return Err(Error::forbidden("Path traversal"));
    }

    let mut resolved = jail_root.to_path_buf();
    for part in stack {
        resolved.push(part);
    }
    Ok(resolved)
}

/// `C:` style prefixes, rejected on every platform.
fn has_drive_letter(filename: &str) -> bool {
    let bytes = filename.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}
