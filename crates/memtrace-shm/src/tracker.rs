//! Allocation interception.
//!
//! [`Tracker`] turns allocator events into table operations. It is driven
//! either by the `LD_PRELOAD` library, which overrides the C allocator of an
//! arbitrary program, or by [`TrackingAllocator`], which wraps a Rust
//! [`GlobalAlloc`].
//!
//! Recording an allocation can itself allocate (symbol resolution, logging,
//! a lazy attach). A thread-local [`ReentrancyGuard`] makes such nested calls
//! go straight to the underlying allocator without being recorded.

use std::alloc::{GlobalAlloc, Layout, System};
use std::cell::Cell;
use std::io::Write as _;
use std::marker::PhantomData;
use std::sync::OnceLock;

use tracing::error;

use crate::config::TrackerConfig;
use crate::record::{AllocationRecord, StackTrace};
use crate::table::SharedTable;
use crate::{Result, TableError};

thread_local! {
    static IN_HOOK: Cell<bool> = const { Cell::new(false) };
}

/// Marks the current thread as inside an allocator hook.
#[derive(Debug)]
pub struct ReentrancyGuard {
    // Tied to the thread that entered.
    _not_send: PhantomData<*const ()>,
}

impl ReentrancyGuard {
    /// Enter the hook, or `None` if this thread is already inside one.
    ///
    /// Also `None` while the thread's locals are being torn down.
    pub fn enter() -> Option<Self> {
        let entered = IN_HOOK
            .try_with(|flag| !flag.replace(true))
            .unwrap_or(false);
        // Built lazily: a refused guard must never exist, or its drop would
        // clear the outer hook's flag.
        entered.then(|| Self {
            _not_send: PhantomData,
        })
    }

    /// Whether the current thread is inside a hook.
    pub fn is_active() -> bool {
        IN_HOOK.try_with(Cell::get).unwrap_or(true)
    }
}

impl Drop for ReentrancyGuard {
    fn drop(&mut self) {
        let _ = IN_HOOK.try_with(|flag| flag.set(false));
    }
}

/// Records allocator events in a shared table.
#[derive(Debug)]
pub struct Tracker {
    table: SharedTable,
    config: TrackerConfig,
}

impl Tracker {
    /// Track into `table`.
    pub const fn new(table: SharedTable, config: TrackerConfig) -> Self {
        Self { table, config }
    }

    /// Track into the table published in the environment, if any.
    pub fn from_env(config: TrackerConfig) -> Result<Option<Self>> {
        Ok(SharedTable::attach_from_env()?.map(|table| Self::new(table, config)))
    }

    /// The table being written to.
    pub const fn table(&self) -> &SharedTable {
        &self.table
    }

    /// Give back the table.
    pub fn into_table(self) -> SharedTable {
        self.table
    }

    /// Record a new block. Null addresses are ignored.
    pub fn on_alloc(&self, address: u64, size: usize) -> Result<()> {
        if address == 0 {
            return Ok(());
        }
        self.table.insert(address, self.record(size))
    }

    /// Forget a block. Returns whether the block was being tracked.
    pub fn on_free(&self, address: u64) -> Result<bool> {
        self.table.delete(address)
    }

    /// Move a block's record to its new address and size.
    pub fn on_realloc(&self, old_address: u64, new_address: u64, size: usize) -> Result<()> {
        if old_address != 0 {
            self.table.delete(old_address)?;
        }
        self.on_alloc(new_address, size)
    }

    fn record(&self, size: usize) -> AllocationRecord {
        let trace = if self.config.symbolize {
            StackTrace::capture_symbolized(self.config.skip_frames)
        } else {
            StackTrace::capture(self.config.skip_frames)
        };
        AllocationRecord::from_size(size).with_stack_trace(trace)
    }

    /// Report a failure that leaves the table unusable and abort.
    ///
    /// Allocator hooks have no way to return an error to their caller.
    pub fn fatal(error: &TableError) -> ! {
        error!("Allocation tracking failed: {error}");
        let _ = writeln!(std::io::stderr(), "memtrace: allocation tracking failed: {error}");
        std::process::abort()
    }
}

/// A tracker attached on first use.
///
/// Starts empty and attaches to the table published in the environment the
/// first time an event is recorded. When no table is published, events are
/// dropped.
#[derive(Debug)]
pub struct LazyTracker {
    cell: OnceLock<Option<Tracker>>,
}

impl LazyTracker {
    /// A tracker attached from the environment on first use.
    pub const fn new() -> Self {
        Self {
            cell: OnceLock::new(),
        }
    }

    /// The tracker in use, attaching it on first call.
    pub fn get(&self) -> Option<&Tracker> {
        self.cell
            .get_or_init(|| {
                Tracker::from_env(TrackerConfig::default()).unwrap_or_else(|e| Tracker::fatal(&e))
            })
            .as_ref()
    }

    /// Take the tracker out, if one was attached.
    pub fn into_inner(self) -> Option<Tracker> {
        self.cell.into_inner().flatten()
    }

    /// Record one allocator event.
    ///
    /// Does nothing when called from inside another event on the same
    /// thread. Failures abort the process.
    pub fn record(&self, event: impl FnOnce(&Tracker) -> Result<()>) {
        let Some(_guard) = ReentrancyGuard::enter() else {
            return;
        };
        if let Some(tracker) = self.get()
            && let Err(e) = event(tracker)
        {
            Tracker::fatal(&e);
        }
    }
}

impl Default for LazyTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Tracker> for LazyTracker {
    fn from(tracker: Tracker) -> Self {
        Self {
            cell: OnceLock::from(Some(tracker)),
        }
    }
}

/// A [`GlobalAlloc`] that records every allocation of the wrapped allocator.
///
/// Without an explicit tracker, the table published in the environment is
/// attached on first use. When none is published the allocator only
/// forwards.
///
/// ```rust,no_run
/// use std::alloc::System;
/// use memtrace_shm::TrackingAllocator;
///
/// #[global_allocator]
/// static GLOBAL: TrackingAllocator<System> = TrackingAllocator::new(System);
/// ```
#[derive(Debug)]
pub struct TrackingAllocator<A = System> {
    inner: A,
    tracker: LazyTracker,
}

impl<A> TrackingAllocator<A> {
    /// Wrap `inner`, attaching lazily from the environment.
    pub const fn new(inner: A) -> Self {
        Self {
            inner,
            tracker: LazyTracker::new(),
        }
    }

    /// Wrap `inner` and record into `tracker`.
    pub fn with_tracker(inner: A, tracker: Tracker) -> Self {
        Self {
            inner,
            tracker: LazyTracker::from(tracker),
        }
    }

    /// The tracker in use, attaching it on first call.
    pub fn tracker(&self) -> Option<&Tracker> {
        self.tracker.get()
    }

    /// Unwrap into the inner allocator and the tracker, if one was attached.
    pub fn into_parts(self) -> (A, Option<Tracker>) {
        (self.inner, self.tracker.into_inner())
    }
}

#[allow(unsafe_code)]
// SAFETY: every method forwards to `inner` with the caller's arguments and
// returns its result unchanged; recording never touches the blocks.
unsafe impl<A: GlobalAlloc> GlobalAlloc for TrackingAllocator<A> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        // SAFETY: forwarded contract.
        let ptr = unsafe { self.inner.alloc(layout) };
        self.tracker.record(|t| t.on_alloc(ptr.addr() as u64, layout.size()));
        ptr
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        // SAFETY: forwarded contract.
        let ptr = unsafe { self.inner.alloc_zeroed(layout) };
        self.tracker.record(|t| t.on_alloc(ptr.addr() as u64, layout.size()));
        ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        // Forget the block first so a concurrent allocation reusing the
        // address is not removed.
        self.tracker.record(|t| t.on_free(ptr.addr() as u64).map(drop));
        // SAFETY: forwarded contract.
        unsafe { self.inner.dealloc(ptr, layout) };
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        // SAFETY: forwarded contract.
        let new_ptr = unsafe { self.inner.realloc(ptr, layout, new_size) };
        if !new_ptr.is_null() {
            self.tracker.record(|t| t.on_realloc(ptr.addr() as u64, new_ptr.addr() as u64, new_size));
        }
        new_ptr
    }
}
