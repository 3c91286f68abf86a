//! Allocator hooks for `LD_PRELOAD`.
//!
//! Loading this library into a program replaces `malloc`, `calloc`,
//! `realloc` and `free`. Every call is forwarded to the next definition in
//! the lookup order (normally the C library) and recorded in the table named
//! by `MEMTRACE_TABLE`. Without that variable the hooks only forward.
//!
//! The real functions are looked up with `dlsym(RTLD_NEXT, ..)` on first
//! use. The C library's `dlsym` may itself call `calloc`; those requests are
//! served from a small static arena.

use std::cell::Cell;
use std::ffi::{CStr, c_void};
use std::sync::atomic::{AtomicPtr, Ordering};

use memtrace_shm::LazyTracker;

mod arena;

type MallocFn = unsafe extern "C" fn(usize) -> *mut c_void;
type CallocFn = unsafe extern "C" fn(usize, usize) -> *mut c_void;
type ReallocFn = unsafe extern "C" fn(*mut c_void, usize) -> *mut c_void;
type FreeFn = unsafe extern "C" fn(*mut c_void);

static REAL_MALLOC: AtomicPtr<c_void> = AtomicPtr::new(std::ptr::null_mut());
static REAL_CALLOC: AtomicPtr<c_void> = AtomicPtr::new(std::ptr::null_mut());
static REAL_REALLOC: AtomicPtr<c_void> = AtomicPtr::new(std::ptr::null_mut());
static REAL_FREE: AtomicPtr<c_void> = AtomicPtr::new(std::ptr::null_mut());

static TRACKER: LazyTracker = LazyTracker::new();

thread_local! {
    static RESOLVING: Cell<bool> = const { Cell::new(false) };
}

fn resolving() -> bool {
    RESOLVING.try_with(Cell::get).unwrap_or(false)
}

/// Look up the next definition of `name`, caching it in `slot`.
#[allow(unsafe_code)]
fn resolve(slot: &AtomicPtr<c_void>, name: &CStr) -> *mut c_void {
    let cached = slot.load(Ordering::Acquire);
    if !cached.is_null() {
        return cached;
    }

    let _ = RESOLVING.try_with(|flag| flag.set(true));
    // SAFETY: `name` is NUL-terminated; RTLD_NEXT is valid from a shared
    // object.
    let addr = unsafe { libc::dlsym(libc::RTLD_NEXT, name.as_ptr()) };
    let _ = RESOLVING.try_with(|flag| flag.set(false));

    if addr.is_null() {
        die(b"memtrace: dlsym failed to find the real allocator\n");
    }
    slot.store(addr, Ordering::Release);
    addr
}

/// Write `message` to stderr without allocating and abort.
#[allow(unsafe_code)]
fn die(message: &[u8]) -> ! {
    // SAFETY: writing a valid buffer to fd 2.
    unsafe { libc::write(libc::STDERR_FILENO, message.as_ptr().cast(), message.len()) };
    std::process::abort()
}

#[allow(unsafe_code)]
fn real_malloc() -> MallocFn {
    // SAFETY: the symbol is the C library's `malloc`.
    unsafe { std::mem::transmute::<*mut c_void, MallocFn>(resolve(&REAL_MALLOC, c"malloc")) }
}

#[allow(unsafe_code)]
fn real_calloc() -> CallocFn {
    // SAFETY: the symbol is the C library's `calloc`.
    unsafe { std::mem::transmute::<*mut c_void, CallocFn>(resolve(&REAL_CALLOC, c"calloc")) }
}

#[allow(unsafe_code)]
fn real_realloc() -> ReallocFn {
    // SAFETY: the symbol is the C library's `realloc`.
    unsafe { std::mem::transmute::<*mut c_void, ReallocFn>(resolve(&REAL_REALLOC, c"realloc")) }
}

#[allow(unsafe_code)]
fn real_free() -> FreeFn {
    // SAFETY: the symbol is the C library's `free`.
    unsafe { std::mem::transmute::<*mut c_void, FreeFn>(resolve(&REAL_FREE, c"free")) }
}

fn address(ptr: *mut c_void) -> u64 {
    ptr.addr() as u64
}

/// Allocate `size` bytes and record the block.
///
/// # Safety
///
/// Same contract as the C library's `malloc`.
#[allow(unsafe_code)]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn malloc(size: usize) -> *mut c_void {
    if resolving() {
        return arena::alloc(size);
    }
    // SAFETY: forwarded contract.
    let ptr = unsafe { real_malloc()(size) };
    TRACKER.record(|t| t.on_alloc(address(ptr), size));
    ptr
}

/// Allocate a zeroed array and record the block.
///
/// # Safety
///
/// Same contract as the C library's `calloc`.
#[allow(unsafe_code)]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn calloc(count: usize, size: usize) -> *mut c_void {
    let Some(total) = count.checked_mul(size) else {
        return std::ptr::null_mut();
    };
    if resolving() {
        return arena::alloc(total);
    }
    // SAFETY: forwarded contract.
    let ptr = unsafe { real_calloc()(count, size) };
    TRACKER.record(|t| t.on_alloc(address(ptr), total));
    ptr
}

/// Resize a block and move its record.
///
/// # Safety
///
/// Same contract as the C library's `realloc`.
#[allow(unsafe_code)]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
    if arena::contains(ptr) {
        // SAFETY: `malloc` has the same contract for the new block.
        let new_ptr = unsafe { malloc(size) };
        if !new_ptr.is_null() {
            // SAFETY: `ptr` is a live arena block and `new_ptr` holds at
            // least `size` bytes.
            unsafe { arena::copy_out(ptr, new_ptr, size) };
        }
        return new_ptr;
    }

    // SAFETY: forwarded contract.
    let new_ptr = unsafe { real_realloc()(ptr, size) };
    if !new_ptr.is_null() {
        TRACKER.record(|t| t.on_realloc(address(ptr), address(new_ptr), size));
    } else if size == 0 && !ptr.is_null() {
        // The block was freed.
        TRACKER.record(|t| t.on_free(address(ptr)).map(drop));
    }
    new_ptr
}

/// Release a block and forget its record.
///
/// # Safety
///
/// Same contract as the C library's `free`.
#[allow(unsafe_code)]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn free(ptr: *mut c_void) {
    if ptr.is_null() || arena::contains(ptr) {
        return;
    }
    TRACKER.record(|t| t.on_free(address(ptr)).map(drop));
    // SAFETY: forwarded contract.
    unsafe { real_free()(ptr) };
}
