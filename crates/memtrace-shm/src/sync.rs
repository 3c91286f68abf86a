//! Process-shared mutex stored in its own shared segment.
//!
//! The mutex is a `pthread_mutex_t` initialized with
//! `PTHREAD_PROCESS_SHARED`, so every process that maps the segment locks the
//! same kernel-visible object. Locking returns a guard that unlocks on drop.
//!
//! There is no robustness handling: a process that dies while holding the
//! lock wedges the table for everyone else.

use std::mem::{MaybeUninit, size_of};
use std::sync::Arc;

use tracing::warn;

use crate::segment::{Segment, SegmentHandle, SegmentName};
use crate::{Result, TableError};

/// Size of the mutex segment in bytes.
pub const MUTEX_SEGMENT_LEN: u64 = size_of::<libc::pthread_mutex_t>() as u64;

/// A `pthread_mutex_t` living in shared memory.
#[derive(Debug)]
pub struct SharedMutex {
    segment: Segment,
}

impl SharedMutex {
    /// Allocate a new mutex segment and initialize the mutex in it.
    #[allow(unsafe_code)]
    pub fn create(name: SegmentName) -> Result<Self> {
        let segment = Segment::allocate(SegmentHandle::new(name, MUTEX_SEGMENT_LEN))?;
        let raw = segment.as_ptr().cast::<libc::pthread_mutex_t>();

        let mut attr = MaybeUninit::<libc::pthread_mutexattr_t>::uninit();
        // SAFETY: `attr` is a local, properly aligned attribute object and
        // `raw` points to a freshly mapped, page-aligned region large enough
        // for a `pthread_mutex_t` that no other process knows about yet.
        let rc = unsafe {
            let mut rc = libc::pthread_mutexattr_init(attr.as_mut_ptr());
            if rc == 0 {
                rc = libc::pthread_mutexattr_setpshared(
                    attr.as_mut_ptr(),
                    libc::PTHREAD_PROCESS_SHARED,
                );
                if rc == 0 {
                    rc = libc::pthread_mutex_init(raw, attr.as_ptr());
                }
                libc::pthread_mutexattr_destroy(attr.as_mut_ptr());
            }
            rc
        };

        if rc != 0 {
            let _ = segment.release();
            return Err(os_error("pthread_mutex_init", &name, rc));
        }

        Ok(Self { segment })
    }

    /// Map an existing mutex segment into this process.
    pub fn resolve(handle: &SegmentHandle) -> Result<Self> {
        Ok(Self {
            segment: Segment::resolve(handle)?,
        })
    }

    /// Block until the mutex is held by the caller.
    #[allow(unsafe_code)]
    pub fn lock(self: &Arc<Self>) -> Result<SharedMutexGuard> {
        // SAFETY: the mapping outlives this call and holds an initialized
        // process-shared mutex.
        let rc = unsafe { libc::pthread_mutex_lock(self.raw()) };
        if rc != 0 {
            return Err(os_error("pthread_mutex_lock", &self.handle().name, rc));
        }
        Ok(SharedMutexGuard {
            mutex: Arc::clone(self),
        })
    }

    /// Destroy the mutex and release its segment.
    ///
    /// No process may hold or wait on the mutex.
    #[allow(unsafe_code)]
    pub fn destroy(self) -> Result<()> {
        // SAFETY: caller guarantees the mutex is unlocked and unused.
        let rc = unsafe { libc::pthread_mutex_destroy(self.raw()) };
        let destroyed = if rc == 0 {
            Ok(())
        } else {
            Err(os_error("pthread_mutex_destroy", &self.handle().name, rc))
        };
        let released = self.segment.release();
        destroyed.and(released)
    }

    /// Handle of the backing segment.
    pub const fn handle(&self) -> &SegmentHandle {
        self.segment.handle()
    }

    fn raw(&self) -> *mut libc::pthread_mutex_t {
        self.segment.as_ptr().cast()
    }
}

/// Holds a [`SharedMutex`] locked until dropped.
#[derive(Debug)]
pub struct SharedMutexGuard {
    mutex: Arc<SharedMutex>,
}

impl Drop for SharedMutexGuard {
    #[allow(unsafe_code)]
    fn drop(&mut self) {
        // SAFETY: the guard is only created after a successful lock by this
        // thread.
        let rc = unsafe { libc::pthread_mutex_unlock(self.mutex.raw()) };
        if rc != 0 {
            warn!(
                "pthread_mutex_unlock failed for {}: {}",
                self.mutex.handle().name,
                std::io::Error::from_raw_os_error(rc)
            );
        }
    }
}

fn os_error(op: &str, name: &SegmentName, rc: i32) -> TableError {
    TableError::Segment(format!(
        "{op} failed for {name}: {}",
        std::io::Error::from_raw_os_error(rc)
    ))
}
