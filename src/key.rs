//! Stable, process-independent file identity.

use std::os::unix::io::RawFd;

use nix::sys::stat::fstat;

use crate::error::{CacheError, Result};

/// Identifies a cached file independent of any particular handle.
///
/// Two handles to the same file resolve to equal keys; handles to
/// different files resolve to unequal keys. Backed by `(st_dev, st_ino)`
/// rather than a canonical path: fixed-size, embeds directly in shared
/// memory, and survives renames (see `DESIGN.md`, Open Question 1).
///
/// `FileKey::EMPTY` is the sentinel for an unoccupied slot; real files
/// never resolve to it because `st_ino == 0` does not occur for regular
/// files on the platforms this crate targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(C)]
pub struct FileKey {
    pub dev: u64,
    pub ino: u64,
}

impl FileKey {
    pub const EMPTY: FileKey = FileKey { dev: 0, ino: 0 };

    pub fn is_empty(&self) -> bool {
        *self == FileKey::EMPTY
    }

    /// Resolves the key of an already-open file descriptor via `fstat`.
    pub fn resolve(fd: RawFd) -> Result<FileKey> {
        let st = fstat(fd).map_err(|err| CacheError::OpenFailed {
            reason: format!("fstat failed: {}", err),
            source: None,
        })?;

        let key = FileKey {
            dev: st.st_dev as u64,
            ino: st.st_ino as u64,
        };

        if key.is_empty() {
            return Err(CacheError::OpenFailed {
                reason: "fstat produced a zero (dev, ino) pair".to_string(),
                source: None,
            });
        }

        Ok(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_is_sentinel() {
        assert!(FileKey::EMPTY.is_empty());
        assert!(!FileKey { dev: 1, ino: 1 }.is_empty());
    }

    #[test]
    fn resolve_is_stable_and_distinct() {
        let a = tempfile::NamedTempFile::new().unwrap();
        let b = tempfile::NamedTempFile::new().unwrap();

        let fd_a = std::os::unix::io::AsRawFd::as_raw_fd(a.as_file());
        let fd_b = std::os::unix::io::AsRawFd::as_raw_fd(b.as_file());

        let key_a1 = FileKey::resolve(fd_a).unwrap();
        let key_a2 = FileKey::resolve(fd_a).unwrap();
        let key_b = FileKey::resolve(fd_b).unwrap();

        assert_eq!(key_a1, key_a2);
        assert_ne!(key_a1, key_b);
        assert!(!key_a1.is_empty());
    }
}
