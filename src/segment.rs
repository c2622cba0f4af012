//! The named, process-shared memory region: header, clock hand, mutex, and
//! the page slot array.
//!
//! Layout, leaves first: a fixed [`SegmentHeader`] (magic, version,
//! `ref_count`, `clock_hand`, the embedded [`RobustMutex`]), immediately
//! followed by `capacity` [`SlotMeta`] records, followed by the page data
//! region (`capacity * PAGE_SIZE` bytes). The metadata table's size is
//! rounded up to a page boundary so the data region — and therefore every
//! individual page within it — starts page-aligned, satisfying the "data
//! is page-aligned in memory" invariant without resorting to per-slot
//! `#[repr(align(4096))]` gymnastics.
//!
//! Capacity is a run-time parameter of the mapping (computed from
//! [`crate::config::CacheConfig`]) rather than a const generic, following
//! the pointer-arithmetic slot addressing shown in the vortex `shm.rs`
//! reference example — it is what lets the production default (12,800
//! slots) and tiny test configurations (4 slots) share one implementation.

use std::ffi::CString;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use nix::fcntl::OFlag;
use nix::sys::mman::{mmap, munmap, shm_open, shm_unlink, MapFlags, ProtFlags};
use nix::sys::stat::Mode;
use nix::unistd::ftruncate;

use crate::config::CacheConfig;
use crate::error::{CacheError, Result};
use crate::key::FileKey;
use crate::mutex::RobustMutex;

const MAGIC: u64 = 0x5343_4143_4845_3031; // "SCACHE01" ASCII-ish tag

#[repr(C)]
struct SegmentHeader {
    magic: u64,
    capacity: u64,
    page_size: u64,
    ref_count: AtomicU32,
    clock_hand: AtomicUsize,
    mutex: RobustMutex,
}

/// One entry in the shared metadata table. All fields are guarded by the
/// segment's [`RobustMutex`]; they are plain (non-atomic) data because
/// every access to them already holds the lock (see `SPEC_FULL.md` §5) —
/// using atomics on top would buy nothing and would invite code that reads
/// them without the lock.
#[repr(C)]
struct SlotMeta {
    key: FileKey,
    offset: u64,
    used: bool,
    dirty: bool,
}

fn header_region_size() -> usize {
    std::mem::size_of::<SegmentHeader>()
}

fn metadata_region_size(capacity: usize) -> usize {
    capacity * std::mem::size_of::<SlotMeta>()
}

fn round_up_to_page(n: usize, page_size: usize) -> usize {
    (n + page_size - 1) / page_size * page_size
}

fn data_region_offset(capacity: usize, page_size: usize) -> usize {
    round_up_to_page(header_region_size() + metadata_region_size(capacity), page_size)
}

fn segment_size(capacity: usize, page_size: usize) -> usize {
    data_region_offset(capacity, page_size) + capacity * page_size
}

/// An attached view of the shared segment: a raw mapping plus the
/// parameters needed to address slots and pages within it.
///
/// Exists so the cache's process-wide state can hold one `Arc` to this
/// instead of reaching for a bare mutable global (see `SPEC_FULL.md` §9,
/// "process-wide mutable singletons").
pub struct SharedSegmentView {
    base: *mut u8,
    size: usize,
    capacity: usize,
    page_size: usize,
    name: String,
}

// The mapping is process-shared by construction; all mutable access goes
// through the embedded RobustMutex.
unsafe impl Send for SharedSegmentView {}
unsafe impl Sync for SharedSegmentView {}

impl SharedSegmentView {
    /// Attaches to the named segment, creating and one-time-initializing
    /// it if this is the first attacher. Increments `ref_count`.
    pub fn attach(config: &CacheConfig) -> Result<SharedSegmentView> {
        if config.page_size != crate::config::PAGE_SIZE {
            return Err(CacheError::InvalidArgument {
                reason: format!(
                    "page_size {} does not match the compiled-in page size {}",
                    config.page_size,
                    crate::config::PAGE_SIZE
                ),
            });
        }

        let size = segment_size(config.capacity, config.page_size);
        let name = CString::new(config.segment_name.clone()).map_err(|err| {
            CacheError::InvalidArgument {
                reason: format!("segment name contains a NUL byte: {}", err),
            }
        })?;

        // O_EXCL tells us, via its failure, whether we are the first
        // attacher without a separate round-trip.
        let (fd, created) = match shm_open(
            name.as_c_str(),
            OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
            Mode::from_bits_truncate(0o666),
        ) {
            Ok(fd) => (fd, true),
            Err(nix::Error::Sys(nix::errno::Errno::EEXIST)) => {
                let fd = shm_open(name.as_c_str(), OFlag::O_RDWR, Mode::from_bits_truncate(0o666))
                    .map_err(|err| fatal(format!("shm_open (existing) failed: {}", err)))?;
                (fd, false)
            }
            Err(err) => return Err(fatal(format!("shm_open failed: {}", err))),
        };

        if created {
            ftruncate(fd, size as libc::off_t)
                .map_err(|err| fatal(format!("ftruncate failed: {}", err)))?;
        }

        let ptr = unsafe {
            mmap(
                std::ptr::null_mut(),
                size,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                fd,
                0,
            )
            .map_err(|err| fatal(format!("mmap failed: {}", err)))?
        };

        let _ = nix::unistd::close(fd);

        let view = SharedSegmentView {
            base: ptr as *mut u8,
            size,
            capacity: config.capacity,
            page_size: config.page_size,
            name: config.segment_name.clone(),
        };

        if created {
            unsafe { view.initialize_fresh() }?;
        } else {
            view.attach_existing()?;
        }

        Ok(view)
    }

    unsafe fn initialize_fresh(&self) -> Result<()> {
        let header = self.header_mut();
        header.magic = MAGIC;
        header.capacity = self.capacity as u64;
        header.page_size = self.page_size as u64;
        header.ref_count = AtomicU32::new(1);
        header.clock_hand = AtomicUsize::new(0);
        RobustMutex::init_in_place(&mut header.mutex as *mut RobustMutex)?;

        for i in 0..self.capacity {
            let slot = self.slot_mut(i);
            slot.key = FileKey::EMPTY;
            slot.offset = 0;
            slot.used = false;
            slot.dirty = false;
        }

        log::debug!(
            "created shared page cache segment {:?}: {} slots * {} bytes",
            self.name,
            self.capacity,
            self.page_size
        );
        Ok(())
    }

    fn attach_existing(&self) -> Result<()> {
        let header = self.header();
        if header.magic != MAGIC {
            return Err(fatal(format!(
                "segment {:?} has an unrecognized header (bad magic)",
                self.name
            )));
        }
        if header.capacity as usize != self.capacity || header.page_size as usize != self.page_size {
            return Err(fatal(format!(
                "segment {:?} was created with capacity={} page_size={}, this attach asked for capacity={} page_size={}",
                self.name, header.capacity, header.page_size, self.capacity, self.page_size
            )));
        }
        header.ref_count.fetch_add(1, Ordering::AcqRel);
        log::debug!("attached existing shared page cache segment {:?}", self.name);
        Ok(())
    }

    /// Decrements `ref_count`; the process that observes it hit zero
    /// destroys the mutex and unlinks the segment (last-detacher
    /// semantics, see `DESIGN.md` Open Question 3). Every process unmaps
    /// its own view regardless.
    pub fn detach(&self) {
        let previous = self.header().ref_count.fetch_sub(1, Ordering::AcqRel);
        if previous == 1 {
            log::debug!("last detacher: destroying mutex and unlinking {:?}", self.name);
            unsafe {
                let header = self.header_mut();
                RobustMutex::destroy_in_place(&mut header.mutex as *mut RobustMutex);
            }
            if let Ok(name) = CString::new(self.name.clone()) {
                if let Err(err) = shm_unlink(name.as_c_str()) {
                    log::error!("shm_unlink({:?}) failed: {}", self.name, err);
                }
            }
        }
        unsafe {
            if let Err(err) = munmap(self.base as *mut libc::c_void, self.size) {
                log::error!("munmap failed: {}", err);
            }
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn ref_count(&self) -> u32 {
        self.header().ref_count.load(Ordering::Acquire)
    }

    fn header(&self) -> &SegmentHeader {
        unsafe { &*(self.base as *const SegmentHeader) }
    }

    #[allow(clippy::mut_from_ref)]
    unsafe fn header_mut(&self) -> &mut SegmentHeader {
        &mut *(self.base as *mut SegmentHeader)
    }

    fn slot_meta_ptr(&self, index: usize) -> *mut SlotMeta {
        debug_assert!(index < self.capacity);
        unsafe {
            let base = self.base.add(header_region_size()) as *mut SlotMeta;
            base.add(index)
        }
    }

    fn slot(&self, index: usize) -> &SlotMeta {
        unsafe { &*self.slot_meta_ptr(index) }
    }

    #[allow(clippy::mut_from_ref)]
    fn slot_mut(&self, index: usize) -> &mut SlotMeta {
        unsafe { &mut *self.slot_meta_ptr(index) }
    }

    /// The page-aligned data buffer for slot `index`. Always exactly
    /// `page_size()` bytes.
    fn slot_data_mut(&self, index: usize) -> &mut [u8] {
        debug_assert!(index < self.capacity);
        unsafe {
            let data_base = self.base.add(data_region_offset(self.capacity, self.page_size));
            let ptr = data_base.add(index * self.page_size);
            std::slice::from_raw_parts_mut(ptr, self.page_size)
        }
    }

    /// Acquires the segment-wide lock. Every read or mutation of slot
    /// metadata, slot data, or the clock hand happens through the
    /// returned guard's methods.
    pub fn lock(&self) -> Result<SegmentGuard<'_>> {
        let guard = self.header().mutex.lock()?;
        Ok(SegmentGuard {
            segment: self,
            _guard: guard,
        })
    }
}

/// Proof of holding the segment's [`RobustMutex`]; all slot-level
/// operations are methods on this type rather than on
/// [`SharedSegmentView`] directly, so it is impossible to touch shared
/// mutable state without the lock.
pub struct SegmentGuard<'a> {
    segment: &'a SharedSegmentView,
    _guard: crate::mutex::RobustMutexGuard<'a>,
}

/// A snapshot of one slot's identity and status, returned by lookups.
#[derive(Debug, Clone, Copy)]
pub struct SlotInfo {
    pub index: usize,
    pub key: FileKey,
    pub offset: u64,
    pub dirty: bool,
}

impl<'a> SegmentGuard<'a> {
    pub fn capacity(&self) -> usize {
        self.segment.capacity
    }

    pub fn page_size(&self) -> usize {
        self.segment.page_size
    }

    /// Linear scan for a slot with the given identity (§4.3 "Lookup": this
    /// crate keeps exactly one index discipline, the scan, so there is no
    /// auxiliary structure to keep in sync).
    pub fn find(&self, key: FileKey, offset: u64) -> Option<usize> {
        (0..self.segment.capacity).find(|&i| {
            let slot = self.segment.slot(i);
            !slot.key.is_empty() && slot.key == key && slot.offset == offset
        })
    }

    pub fn mark_used(&mut self, index: usize) {
        self.segment.slot_mut(index).used = true;
    }

    pub fn info(&self, index: usize) -> SlotInfo {
        let slot = self.segment.slot(index);
        SlotInfo {
            index,
            key: slot.key,
            offset: slot.offset,
            dirty: slot.dirty,
        }
    }

    pub fn data(&mut self, index: usize) -> &mut [u8] {
        self.segment.slot_data_mut(index)
    }

    pub fn set_dirty(&mut self, index: usize, dirty: bool) {
        self.segment.slot_mut(index).dirty = dirty;
    }

    /// Advances the CLOCK hand to select a victim slot, per §4.3. Clears
    /// the reference bit of every slot it passes over except the victim
    /// itself. Terminates within at most two full sweeps.
    pub fn select_victim(&mut self) -> usize {
        let capacity = self.segment.capacity;
        for _ in 0..(2 * capacity + 1) {
            let hand = self.segment.header().clock_hand.load(Ordering::Acquire);
            let slot = self.segment.slot(hand);
            let victim = slot.key.is_empty() || !slot.used;
            if victim {
                self.advance_hand();
                return hand;
            }
            self.segment.slot_mut(hand).used = false;
            self.advance_hand();
        }
        unreachable!("CLOCK sweep exceeded 2*capacity+1 visits; invariant violated")
    }

    fn advance_hand(&mut self) {
        let capacity = self.segment.capacity;
        self.segment
            .header()
            .clock_hand
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |hand| {
                Some((hand + 1) % capacity)
            })
            .ok();
    }

    /// Installs a new identity into `index`, overwriting whatever was
    /// there. The caller is responsible for having already written back
    /// the previous occupant if it was dirty.
    pub fn install(&mut self, index: usize, key: FileKey, offset: u64) {
        let slot = self.segment.slot_mut(index);
        slot.key = key;
        slot.offset = offset;
        slot.used = true;
        slot.dirty = false;
    }

    /// Resets a slot to the unoccupied sentinel state.
    pub fn clear(&mut self, index: usize) {
        let slot = self.segment.slot_mut(index);
        slot.key = FileKey::EMPTY;
        slot.offset = 0;
        slot.used = false;
        slot.dirty = false;
    }

    /// All slot indices currently owned by `key`, in slot order.
    pub fn slots_for_key(&self, key: FileKey) -> Vec<usize> {
        (0..self.segment.capacity)
            .filter(|&i| self.segment.slot(i).key == key)
            .collect()
    }
}

fn fatal(reason: String) -> CacheError {
    CacheError::FatalInit(anyhow::anyhow!(reason))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_keeps_data_region_page_aligned() {
        let offset = data_region_offset(4, 4096);
        assert_eq!(offset % 4096, 0);
        assert!(offset >= header_region_size() + metadata_region_size(4));
    }

    #[test]
    fn segment_size_fits_exactly_capacity_pages() {
        let capacity = 4;
        let size = segment_size(capacity, 4096);
        let data_start = data_region_offset(capacity, 4096);
        assert_eq!(size - data_start, capacity * 4096);
    }
}
