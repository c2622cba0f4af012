//! Error kinds surfaced by the cache, and their syscall-boundary conversions.

use std::os::unix::io::RawFd;

use thiserror::Error;

/// Everything that can go wrong when talking to the shared page cache.
///
/// Variant names follow the five kinds from the specification; they are
/// ordinary enum variants, not part of any external wire format.
#[derive(Error, Debug)]
pub enum CacheError {
    /// OS open, shared-segment creation, or file-key resolution failed.
    #[error("open failed: {reason}")]
    OpenFailed {
        reason: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    /// An operation was given a handle that is not in the Descriptor Table.
    #[error("unknown handle {handle}")]
    UnknownHandle { handle: RawFd },

    /// Nonsense seek, bad origin, or an oversized request to an operation
    /// that does not bypass the cache.
    #[error("invalid argument: {reason}")]
    InvalidArgument { reason: String },

    /// A backing-file read or write failed during miss-fill, eviction
    /// write-back, or fsync.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// The shared segment could not be attached; the process cannot
    /// proceed without operator intervention.
    #[error("fatal cache initialization failure: {0}")]
    FatalInit(#[source] anyhow::Error),
}

impl From<nix::Error> for CacheError {
    fn from(err: nix::Error) -> Self {
        let raw = err.as_errno().unwrap_or(nix::errno::Errno::EIO) as i32;
        CacheError::IoError(std::io::Error::from_raw_os_error(raw))
    }
}

pub type Result<T> = std::result::Result<T, CacheError>;
