//! The process-local Descriptor Table.
//!
//! Modeled on the descriptor/handle tables real caching layers keep for
//! open files (see `examples/other_examples`'
//! `fjall-rs/lsm-tree::descriptor_table`, which guards a `HashMap` of open
//! handles behind a lock) rather than the source's single free-standing
//! `std::unordered_map` global.

use std::collections::HashMap;
use std::os::unix::io::RawFd;

use crate::error::{CacheError, Result};
use crate::key::FileKey;

/// One open handle: the underlying OS file descriptor, the logical
/// cursor owned by this handle, and the file key resolved at open time.
pub struct DescriptorEntry {
    pub os_handle: RawFd,
    pub cursor: i64,
    pub key: FileKey,
}

/// Per-process table from opaque handle (the OS fd, reused as the handle
/// value) to [`DescriptorEntry`]. Not shared across processes; guarded by
/// an ordinary `Mutex` in [`crate::cache::Cache`] against concurrent use
/// from multiple threads of the same process.
#[derive(Default)]
pub struct DescriptorTable {
    entries: HashMap<RawFd, DescriptorEntry>,
}

impl DescriptorTable {
    pub fn new() -> Self {
        DescriptorTable {
            entries: HashMap::new(),
        }
    }

    pub fn insert(&mut self, handle: RawFd, entry: DescriptorEntry) {
        self.entries.insert(handle, entry);
    }

    pub fn remove(&mut self, handle: RawFd) -> Result<DescriptorEntry> {
        self.entries
            .remove(&handle)
            .ok_or(CacheError::UnknownHandle { handle })
    }

    pub fn get(&self, handle: RawFd) -> Result<&DescriptorEntry> {
        self.entries
            .get(&handle)
            .ok_or(CacheError::UnknownHandle { handle })
    }

    pub fn get_mut(&mut self, handle: RawFd) -> Result<&mut DescriptorEntry> {
        self.entries
            .get_mut(&handle)
            .ok_or(CacheError::UnknownHandle { handle })
    }

    /// Finds any open handle for `key`, used by the Engine's eviction
    /// write-back (§4.3): since file identity is `(dev, ino)` rather than
    /// a path, write-back can only reuse a handle this process already
    /// has open, never reopen one out of thin air.
    pub fn any_handle_for_key(&self, key: FileKey) -> Option<RawFd> {
        self.entries
            .iter()
            .find(|(_, entry)| entry.key == key)
            .map(|(handle, _)| *handle)
    }
}
