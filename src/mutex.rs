//! A process-shared, crash-robust mutex embedded directly in the shared
//! segment.
//!
//! `nix` does not wrap `pthread_mutex_t` (it is not a file-descriptor-based
//! primitive), so this goes straight to `libc`, the way the rest of this
//! crate reaches for `nix` wrappers around everything that *is* fd-based
//! (`tools::lock_file`'s `flock` wrapping in the teacher is the same idea,
//! one level up).
//!
//! The mutex is configured `PTHREAD_PROCESS_SHARED | PTHREAD_MUTEX_ROBUST`:
//! if a holder dies while the lock is held, the next locker observes
//! `EOWNERDEAD`, calls `pthread_mutex_consistent`, and proceeds holding the
//! lock. This is the one place in the crate laid out by §5/§9 of
//! `SPEC_FULL.md` as REQUIRED rather than optional: without it, a crashed
//! peer wedges the whole segment for everyone else forever.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;

use crate::error::{CacheError, Result};

/// Embedded directly in the shared segment header; every attached process
/// maps the same bytes, so the mutex is shared the moment the segment is
/// shared, with no separate "export a handle" step.
#[repr(C)]
pub struct RobustMutex {
    inner: UnsafeCell<libc::pthread_mutex_t>,
}

// The whole point of this type is to be shared across threads and
// processes; the robust, process-shared pthread attributes make that safe.
unsafe impl Send for RobustMutex {}
unsafe impl Sync for RobustMutex {}

impl RobustMutex {
    /// Initializes the mutex in place. Must be called exactly once, by the
    /// first attacher, before any other process locks it.
    ///
    /// # Safety
    /// `this` must point at shared-memory storage that outlives every
    /// process that will lock it, and must not already be initialized.
    pub unsafe fn init_in_place(this: *mut RobustMutex) -> Result<()> {
        let mut attr = MaybeUninit::<libc::pthread_mutexattr_t>::uninit();
        fatal_if_nonzero(libc::pthread_mutexattr_init(attr.as_mut_ptr()), "pthread_mutexattr_init")?;
        let mut attr = attr.assume_init();

        fatal_if_nonzero(
            libc::pthread_mutexattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED),
            "pthread_mutexattr_setpshared",
        )?;
        fatal_if_nonzero(
            libc::pthread_mutexattr_setrobust(&mut attr, libc::PTHREAD_MUTEX_ROBUST),
            "pthread_mutexattr_setrobust",
        )?;

        let mutex_ptr = (*this).inner.get();
        let rc = libc::pthread_mutex_init(mutex_ptr, &attr);
        libc::pthread_mutexattr_destroy(&mut attr);
        fatal_if_nonzero(rc, "pthread_mutex_init")?;

        Ok(())
    }

    /// Acquires the lock, recovering from a dead holder if necessary.
    ///
    /// On `EOWNERDEAD` the mutex is marked consistent and the lock is
    /// still considered acquired: the segment's invariants are assumed to
    /// hold because every mutation under this lock is a short, bounded
    /// sequence of plain-old-data writes (§5), so a half-applied mutation
    /// from the dead holder is, at worst, a stale-looking slot that the
    /// next lookup or eviction will simply overwrite.
    pub fn lock(&self) -> Result<RobustMutexGuard<'_>> {
        let rc = unsafe { libc::pthread_mutex_lock(self.inner.get()) };
        match rc {
            0 => Ok(RobustMutexGuard { mutex: self }),
            libc::EOWNERDEAD => {
                log::warn!("recovering shared page cache mutex from a dead holder");
                let consistent_rc = unsafe { libc::pthread_mutex_consistent(self.inner.get()) };
                if consistent_rc != 0 {
                    return Err(CacheError::FatalInit(anyhow::anyhow!(
                        "pthread_mutex_consistent failed: errno {}",
                        consistent_rc
                    )));
                }
                Ok(RobustMutexGuard { mutex: self })
            }
            other => Err(CacheError::FatalInit(anyhow::anyhow!(
                "pthread_mutex_lock failed: errno {}",
                other
            ))),
        }
    }

    fn unlock(&self) {
        let rc = unsafe { libc::pthread_mutex_unlock(self.inner.get()) };
        if rc != 0 {
            log::error!("pthread_mutex_unlock failed: errno {}", rc);
        }
    }

    /// Destroys the mutex. Must only be called by the last detacher, after
    /// every other process has stopped touching the segment.
    ///
    /// # Safety
    /// No other thread or process may hold or attempt to lock this mutex
    /// concurrently with or after this call.
    pub unsafe fn destroy_in_place(this: *mut RobustMutex) {
        let rc = libc::pthread_mutex_destroy((*this).inner.get());
        if rc != 0 {
            log::error!("pthread_mutex_destroy failed: errno {}", rc);
        }
    }
}

/// RAII guard returned by [`RobustMutex::lock`]; unlocks on drop.
pub struct RobustMutexGuard<'a> {
    mutex: &'a RobustMutex,
}

impl Drop for RobustMutexGuard<'_> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}

fn fatal_if_nonzero(rc: libc::c_int, what: &str) -> Result<()> {
    if rc == 0 {
        Ok(())
    } else {
        Err(CacheError::FatalInit(anyhow::anyhow!(
            "{} failed: errno {}",
            what,
            rc
        )))
    }
}
