//! Static bump arena for allocations made while the real allocator is being
//! looked up.
//!
//! Blocks are never reused. Each block is preceded by a 16-byte header
//! holding its requested size, so `realloc` can move it out.

use std::cell::UnsafeCell;
use std::ffi::c_void;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

const ALIGN: usize = 16;
const HEADER: usize = 16;

#[repr(C, align(16))]
pub(crate) struct BumpArena<const N: usize> {
    bytes: UnsafeCell<[u8; N]>,
    used: AtomicUsize,
}

// SAFETY: every block is claimed exactly once through `used`, so no two
// callers ever touch the same bytes.
#[allow(unsafe_code)]
unsafe impl<const N: usize> Sync for BumpArena<N> {}

impl<const N: usize> BumpArena<N> {
    pub(crate) const fn new() -> Self {
        Self {
            bytes: UnsafeCell::new([0; N]),
            used: AtomicUsize::new(0),
        }
    }

    fn base(&self) -> *mut u8 {
        self.bytes.get().cast()
    }

    /// Claim a zeroed block of `size` bytes, or null when the arena is full.
    #[allow(unsafe_code)]
    pub(crate) fn alloc(&self, size: usize) -> *mut c_void {
        let Some(need) = size
            .checked_add(HEADER + ALIGN - 1)
            .map(|n| n & !(ALIGN - 1))
        else {
            return ptr::null_mut();
        };

        let mut start = self.used.load(Ordering::Relaxed);
        loop {
            let end = match start.checked_add(need) {
                Some(end) if end <= N => end,
                _ => return ptr::null_mut(),
            };
            match self
                .used
                .compare_exchange_weak(start, end, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(current) => start = current,
            }
        }

        // SAFETY: `start..start + need` lies inside the arena, is 16-byte
        // aligned and belongs to this call alone.
        unsafe {
            let block = self.base().add(start);
            block.cast::<usize>().write(size);
            block.add(HEADER).cast()
        }
    }

    /// Whether `ptr` points into the arena.
    pub(crate) fn contains(&self, ptr: *const c_void) -> bool {
        let base = self.base().addr();
        (base..base + N).contains(&ptr.addr())
    }

    /// Copy the contents of arena block `src` into `dst`, up to `limit` bytes.
    ///
    /// # Safety
    ///
    /// `src` must have been returned by [`Self::alloc`] and `dst` must be
    /// valid for `limit` bytes of writes.
    #[allow(unsafe_code)]
    pub(crate) unsafe fn copy_out(&self, src: *const c_void, dst: *mut c_void, limit: usize) {
        // SAFETY: every block is preceded by its size header.
        unsafe {
            let src = src.cast::<u8>();
            let size = src.sub(HEADER).cast::<usize>().read();
            ptr::copy_nonoverlapping(src, dst.cast::<u8>(), size.min(limit));
        }
    }
}

static BOOTSTRAP: BumpArena<{ 16 * 1024 }> = BumpArena::new();

pub(crate) fn alloc(size: usize) -> *mut c_void {
    BOOTSTRAP.alloc(size)
}

pub(crate) fn contains(ptr: *const c_void) -> bool {
    BOOTSTRAP.contains(ptr)
}

/// See [`BumpArena::copy_out`].
#[allow(unsafe_code)]
pub(crate) unsafe fn copy_out(src: *const c_void, dst: *mut c_void, limit: usize) {
    // SAFETY: forwarded contract.
    unsafe { BOOTSTRAP.copy_out(src, dst, limit) }
}

#[cfg(test)]
#[allow(clippy::expect_used, unsafe_code)]
mod tests {
    use super::*;

    #[test]
    fn test_blocks_are_aligned_and_disjoint() {
        let arena = BumpArena::<1024>::new();
        let a = arena.alloc(3);
        let b = arena.alloc(40);
        assert!(!a.is_null() && !b.is_null());
        assert_eq!(a.addr() % ALIGN, 0);
        assert_eq!(b.addr() % ALIGN, 0);
        assert_eq!(b.addr() - a.addr(), 32);
        assert!(arena.contains(a));
        assert!(arena.contains(b));
        assert!(!arena.contains(ptr::null()));
    }

    #[test]
    fn test_exhaustion_returns_null() {
        let arena = BumpArena::<64>::new();
        // 16 bytes plus header take 32 of the 64
        assert!(!arena.alloc(16).is_null());
        assert!(arena.alloc(32).is_null());
        assert!(!arena.alloc(16).is_null());
        assert!(arena.alloc(0).is_null());
        assert!(arena.alloc(usize::MAX).is_null());
    }

    #[test]
    fn test_copy_out_respects_both_sizes() {
        let arena = BumpArena::<256>::new();
        let src = arena.alloc(8);
        // SAFETY: the block holds 8 bytes.
        unsafe { ptr::copy_nonoverlapping([1u8, 2, 3, 4, 5, 6, 7, 8].as_ptr(), src.cast(), 8) };

        let mut small = [0u8; 4];
        // SAFETY: `small` holds 4 bytes.
        unsafe { arena.copy_out(src, small.as_mut_ptr().cast(), 4) };
        assert_eq!(small, [1, 2, 3, 4]);

        let mut large = [0u8; 16];
        // SAFETY: `large` holds 16 bytes.
        unsafe { arena.copy_out(src, large.as_mut_ptr().cast(), 16) };
        assert_eq!(&large[..8], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(&large[8..], &[0; 8]);
    }
}
