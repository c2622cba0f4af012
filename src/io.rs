//! I/O Path: decomposes a caller request into page-aligned segments against
//! the current cursor, driving the Engine for each one.
//!
//! The decomposition loop is the direct descendant of
//! `examples/original_source/lab2/lab2.cpp`'s `lab2_read`/`lab2_write`,
//! rewritten against [`crate::engine::locate_or_install`] instead of three
//! copies of an inline cache scan, and with read-modify-write added for
//! sub-page writes (§4.4 mandates it; the source left it undefined).

use std::os::unix::io::RawFd;

use crate::descriptor::DescriptorTable;
use crate::engine::{self, Located};
use crate::error::Result;
use crate::segment::SegmentGuard;

/// One page-aligned segment of a larger request.
struct Segment {
    aligned_offset: u64,
    page_offset: usize,
    chunk: usize,
}

fn decompose(cursor: i64, remaining: usize, page_size: usize) -> Segment {
    let cursor = cursor as u64;
    let aligned_offset = (cursor / page_size as u64) * page_size as u64;
    let page_offset = (cursor % page_size as u64) as usize;
    let chunk = std::cmp::min(page_size - page_offset, remaining);
    Segment {
        aligned_offset,
        page_offset,
        chunk,
    }
}

/// `count` strictly greater than this bypasses the cache entirely (§4.4).
pub fn exceeds_capacity(count: usize, capacity: usize, page_size: usize) -> bool {
    count > capacity * page_size
}

/// Reads up to `buf.len()` bytes starting at the descriptor's cursor,
/// advancing it by the amount actually read. Returns the number of bytes
/// copied, which is less than `buf.len()` only at EOF.
pub fn read_through(
    guard: &mut SegmentGuard<'_>,
    descriptors: &DescriptorTable,
    os_handle: RawFd,
    key: crate::key::FileKey,
    cursor: &mut i64,
    buf: &mut [u8],
) -> Result<usize> {
    let page_size = guard.page_size();
    let mut copied = 0;
    let mut remaining = buf.len();

    while remaining > 0 {
        let seg = decompose(*cursor, remaining, page_size);

        let located = engine::locate_or_install(guard, descriptors, key, seg.aligned_offset, |page| {
            engine::pread_page(os_handle, page, seg.aligned_offset as libc::off_t)
        })?;
        let index = match located {
            Located::Hit(i) | Located::Miss(i) => i,
        };

        // A dirty slot holds writes that have not reached the backing file
        // yet (write-back is deferred to eviction/fsync/close), so its
        // on-disk size is stale and must not be used to clamp the read:
        // trust the full cached page instead. A clean slot was loaded
        // straight from disk, so its tail past the real EOF is exactly
        // what `read_page_tail_len` computes.
        let available_in_page = if guard.info(index).dirty {
            seg.chunk
        } else {
            let page_end = read_page_tail_len(os_handle, seg.aligned_offset, page_size)?;
            page_end.saturating_sub(seg.page_offset).min(seg.chunk)
        };

        let data = guard.data(index);
        buf[copied..copied + available_in_page]
            .copy_from_slice(&data[seg.page_offset..seg.page_offset + available_in_page]);

        copied += available_in_page;
        *cursor += available_in_page as i64;
        remaining -= seg.chunk;

        if available_in_page < seg.chunk {
            // Hit EOF inside this page; nothing more to read.
            break;
        }
    }

    Ok(copied)
}

/// How many bytes of the page starting at `aligned_offset` actually exist
/// in the file (<= page_size; equal to page_size unless this is the last,
/// partial page of the file). Used only to bound a *read* at EOF — slots
/// themselves always hold a full, zero-padded page (§4.3).
fn read_page_tail_len(os_handle: RawFd, aligned_offset: u64, page_size: usize) -> Result<usize> {
    let file_size = nix::sys::stat::fstat(os_handle)?.st_size as u64;
    if aligned_offset >= file_size {
        return Ok(0);
    }
    Ok(std::cmp::min(page_size as u64, file_size - aligned_offset) as usize)
}

/// Writes `buf.len()` bytes starting at the descriptor's cursor, marking
/// every touched slot dirty. Write-back is deferred to eviction, fsync,
/// or close (§4.4) — this never touches the backing file directly.
pub fn write_through(
    guard: &mut SegmentGuard<'_>,
    descriptors: &DescriptorTable,
    os_handle: RawFd,
    key: crate::key::FileKey,
    cursor: &mut i64,
    buf: &[u8],
) -> Result<usize> {
    let page_size = guard.page_size();
    let mut written = 0;
    let mut remaining = buf.len();

    while remaining > 0 {
        let seg = decompose(*cursor, remaining, page_size);

        // Read-modify-write: a sub-page write into a freshly-installed
        // slot must first see the on-disk bytes outside [page_offset,
        // page_offset+chunk) (§4.4, mandated — the source left this
        // undefined, see `DESIGN.md` Open Question 2).
        let located = engine::locate_or_install(guard, descriptors, key, seg.aligned_offset, |page| {
            engine::pread_page(os_handle, page, seg.aligned_offset as libc::off_t)
        })?;
        let index = match located {
            Located::Hit(i) | Located::Miss(i) => i,
        };

        let data = guard.data(index);
        data[seg.page_offset..seg.page_offset + seg.chunk]
            .copy_from_slice(&buf[written..written + seg.chunk]);
        guard.set_dirty(index, true);
        guard.mark_used(index);

        written += seg.chunk;
        *cursor += seg.chunk as i64;
        remaining -= seg.chunk;
    }

    Ok(written)
}
