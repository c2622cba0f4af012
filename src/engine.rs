//! Lookup & Replacement Engine: `locate_or_install`, the one operation the
//! rest of the crate needs from the cache proper.
//!
//! Grounded on the CLOCK sweep in `examples/original_source/lab2/lab2.cpp`'s
//! `manage_cache`, generalized to: run entirely under the segment's
//! [`crate::mutex::RobustMutex`] (the source had no mutex at all), use the
//! fixed-size `(dev, ino)` key instead of a fixed `char path[256]` buffer,
//! and restrict write-back to a handle this process already owns (see
//! `DESIGN.md`, Open Question 1) instead of reopening by path.

use crate::descriptor::DescriptorTable;
use crate::error::{CacheError, Result};
use crate::key::FileKey;
use crate::segment::{SegmentGuard, SlotInfo};

/// Outcome of a lookup: which slot now holds the page, and whether it was
/// already resident (`Hit`) or had to be loaded (`Miss`, in which case the
/// loader has already run by the time this is returned).
pub enum Located {
    Hit(usize),
    Miss(usize),
}

/// Finds the slot for `(key, aligned_offset)`, installing it via CLOCK
/// eviction and `loader` on a miss.
///
/// `loader` fills a page-sized buffer with the page's current contents
/// (for a read-miss: the on-disk bytes, zero-padded past EOF; for a
/// sub-page write-miss: also the on-disk bytes, so the read-modify-write
/// in `crate::io` has something to merge into). It is only invoked on a
/// miss, matching §4.3 exactly.
pub fn locate_or_install(
    guard: &mut SegmentGuard<'_>,
    descriptors: &DescriptorTable,
    key: FileKey,
    aligned_offset: u64,
    loader: impl FnOnce(&mut [u8]) -> Result<()>,
) -> Result<Located> {
    if let Some(index) = guard.find(key, aligned_offset) {
        guard.mark_used(index);
        return Ok(Located::Hit(index));
    }

    let victim = guard.select_victim();
    let victim_info = guard.info(victim);

    if victim_info.dirty {
        write_back(guard, descriptors, victim, victim_info)?;
    }

    // Loader writes into the victim's page before the identity swap is
    // visible to any other lookup, since we are still holding the lock.
    loader(guard.data(victim))?;
    guard.install(victim, key, aligned_offset);

    Ok(Located::Miss(victim))
}

/// Writes a dirty victim's page back to its owning file, using an
/// already-open handle for that key. Leaves the slot dirty and unreused
/// on failure, per §4.3.
pub fn write_back(
    guard: &mut SegmentGuard<'_>,
    descriptors: &DescriptorTable,
    index: usize,
    info: SlotInfo,
) -> Result<()> {
    let handle = descriptors.any_handle_for_key(info.key).ok_or_else(|| {
        CacheError::IoError(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "no open handle available to write back a dirty page during eviction",
        ))
    })?;

    let data = guard.data(index);
    pwrite_all(handle, data, info.offset as libc::off_t)?;
    guard.set_dirty(index, false);
    Ok(())
}

/// Page-aligned positional write, retried across short writes and
/// `EINTR`, matching the bounded, page-at-a-time suspension points
/// allowed under the lock by §5.
pub fn pwrite_all(fd: std::os::unix::io::RawFd, buf: &[u8], offset: libc::off_t) -> Result<()> {
    let mut written = 0usize;
    while written < buf.len() {
        match nix::sys::uio::pwrite(fd, &buf[written..], offset + written as libc::off_t) {
            Ok(0) => {
                return Err(CacheError::IoError(std::io::Error::new(
                    std::io::ErrorKind::WriteZero,
                    "pwrite returned 0",
                )))
            }
            Ok(n) => written += n,
            Err(nix::Error::Sys(nix::errno::Errno::EINTR)) => continue,
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

/// Page-aligned positional read into a full page buffer, zero-padding any
/// tail past EOF, matching the loader contract in §4.3.
pub fn pread_page(fd: std::os::unix::io::RawFd, buf: &mut [u8], offset: libc::off_t) -> Result<()> {
    let mut read = 0usize;
    loop {
        if read == buf.len() {
            break;
        }
        match nix::sys::uio::pread(fd, &mut buf[read..], offset + read as libc::off_t) {
            Ok(0) => break, // short read at EOF: zero-pad the remainder
            Ok(n) => read += n,
            Err(nix::Error::Sys(nix::errno::Errno::EINTR)) => continue,
            Err(err) => return Err(err.into()),
        }
    }
    for b in &mut buf[read..] {
        *b = 0;
    }
    Ok(())
}
