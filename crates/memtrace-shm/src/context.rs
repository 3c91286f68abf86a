//! Per-process resolution of table segments.
//!
//! The table header only stores segment handles. Before an operation can
//! touch the mutex or the slot array, the calling process needs mappings of
//! its own. [`LocalContext`] caches them, keyed by the pid that resolved them
//! and by the header's resize epoch:
//!
//! - a different pid (first use, or a forked child) resolves the mutex and
//!   the entries afresh
//! - a different epoch (a resize happened, in this process or a sibling)
//!   re-resolves the entries once the shared mutex is held
//!
//! [`acquire`] returns a [`ContextGuard`] that holds both the process-local
//! cache lock and the shared mutex. Dropping it releases the shared mutex
//! first, on every exit path.
//!
//! The guard also marks the thread as inside an allocator hook. Anything a
//! table operation allocates while locked (resolution, logging, a scan's
//! report) is then never recorded back into a table by the same thread,
//! which would otherwise block on the lock it already holds.

use std::mem::size_of;
use std::slice;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use tracing::debug;

use crate::schedule;
use crate::segment::{Segment, SegmentHandle};
use crate::sync::{SharedMutex, SharedMutexGuard};
use crate::table::{Entry, TableHeader};
use crate::tracker::ReentrancyGuard;
use crate::{Result, TableError};

/// Mappings resolved by the current process.
#[derive(Debug, Default)]
pub(crate) struct LocalContext {
    /// Process that resolved the cached mappings (0 = never resolved).
    pid: u32,
    /// Header epoch the cached entries mapping belongs to.
    epoch: u64,
    mutex: Option<Arc<SharedMutex>>,
    entries: Option<Segment>,
}

impl LocalContext {
    /// Cache for a process that created the segments itself.
    pub(crate) fn resolved(mutex: SharedMutex, entries: Segment, epoch: u64) -> Self {
        Self {
            pid: std::process::id(),
            epoch,
            mutex: Some(Arc::new(mutex)),
            entries: Some(entries),
        }
    }

    /// Give up the cached mappings.
    pub(crate) fn into_parts(self) -> (Option<Arc<SharedMutex>>, Option<Segment>) {
        (self.mutex, self.entries)
    }
}

/// Exclusive access to a table for the duration of one operation.
pub(crate) struct ContextGuard<'a> {
    // Field order matters: the shared mutex is unlocked before the local
    // cache lock is released.
    _shared: SharedMutexGuard,
    local: MutexGuard<'a, LocalContext>,
    // `None` when the caller is already inside a hook and its own guard
    // covers this operation.
    _hook: Option<ReentrancyGuard>,
    header: *mut TableHeader,
}

/// Resolve the table's segments for this process if needed and lock it.
///
/// `header` must point to the mapped header segment of the table that owns
/// `local`, and stay mapped for as long as the guard lives.
pub(crate) fn acquire<'a>(
    local: &'a Mutex<LocalContext>,
    header: *mut TableHeader,
) -> Result<ContextGuard<'a>> {
    let hook = ReentrancyGuard::enter();
    let mut local = local.lock();
    let pid = std::process::id();

    if local.pid != pid || local.mutex.is_none() {
        // SAFETY: the mutex handle is written once at creation and never
        // changes afterwards, so it can be read without holding the lock.
        #[allow(unsafe_code)]
        let mutex_handle: SegmentHandle = unsafe { (*header).mutex };

        debug!(
            "Resolving table context in process {pid} (previous {})",
            local.pid
        );
        local.mutex = Some(Arc::new(SharedMutex::resolve(&mutex_handle)?));
        local.entries = None;
        local.pid = pid;
    }

    let shared = local
        .mutex
        .as_ref()
        .ok_or_else(|| TableError::Segment("table mutex is not resolved".to_string()))?
        .lock()?;

    let mut guard = ContextGuard {
        _shared: shared,
        local,
        _hook: hook,
        header,
    };

    let (epoch, entries) = {
        let header = guard.header();
        (header.epoch, header.entries)
    };
    if guard.local.entries.is_none() || guard.local.epoch != epoch {
        debug!(
            "Re-resolving entries {} (epoch {} -> {epoch})",
            entries.name, guard.local.epoch
        );
        // Replacing the cached segment detaches the stale mapping.
        guard.local.entries = Some(Segment::resolve(&entries)?);
        guard.local.epoch = epoch;
    }
    guard.header_mut().context = pid;

    Ok(guard)
}

impl ContextGuard<'_> {
    /// The shared table header.
    #[allow(unsafe_code)]
    pub(crate) fn header(&self) -> &TableHeader {
        // SAFETY: the header stays mapped for the guard's lifetime and the
        // shared mutex serializes every access to it.
        unsafe { &*self.header }
    }

    /// The shared table header, mutably.
    #[allow(unsafe_code)]
    pub(crate) fn header_mut(&mut self) -> &mut TableHeader {
        // SAFETY: as above; holding the shared mutex makes this the only
        // live reference in any process.
        unsafe { &mut *self.header }
    }

    /// Slot array of the current epoch.
    pub(crate) fn entries(&self) -> &[Entry] {
        let capacity = schedule::capacity(self.header().capacity_index) as usize;
        self.local
            .entries
            .as_ref()
            .map_or(Default::default(), |segment| entry_slice(segment, capacity))
    }

    /// Header and slot array together, for updates that touch both.
    pub(crate) fn split_mut(&mut self) -> (&mut TableHeader, &mut [Entry]) {
        // SAFETY: see `header_mut`; the header and the entries live in
        // different segments, so the two borrows never overlap.
        #[allow(unsafe_code)]
        let header = unsafe { &mut *self.header };
        let capacity = schedule::capacity(header.capacity_index) as usize;
        let entries = self
            .local
            .entries
            .as_mut()
            .map_or(Default::default(), |segment| entry_slice_mut(segment, capacity));
        (header, entries)
    }

    /// Swap in a rebuilt slot array and start a new epoch.
    ///
    /// Returns the previous entries segment so the caller can release it.
    pub(crate) fn install_entries(
        &mut self,
        entries: Segment,
        capacity_index: u32,
        epoch: u64,
    ) -> Option<Segment> {
        let handle = *entries.handle();
        let header = self.header_mut();
        header.entries = handle;
        header.capacity_index = capacity_index;
        header.tombstones = 0;
        header.epoch = epoch;

        self.local.epoch = epoch;
        self.local.entries.replace(entries)
    }
}

/// View a mapped entries segment as slots.
#[allow(unsafe_code)]
pub(crate) fn entry_slice(segment: &Segment, capacity: usize) -> &[Entry] {
    debug_assert!(segment.len() >= capacity * size_of::<Entry>());
    // SAFETY: the segment is page-aligned, at least `capacity` entries long
    // (checked when it was allocated or resolved) and all-zero bytes are a
    // valid `Entry`.
    unsafe {
        slice::from_raw_parts(segment.as_ptr().cast::<Entry>(), capacity)
    }
}

/// Mutable view of a mapped entries segment.
#[allow(unsafe_code)]
pub(crate) fn entry_slice_mut(segment: &mut Segment, capacity: usize) -> &mut [Entry] {
    debug_assert!(segment.len() >= capacity * size_of::<Entry>());
    // SAFETY: as `entry_slice`; the `&mut Segment` plus the table lock make
    // this the only view of the mapping.
    unsafe {
        slice::from_raw_parts_mut(segment.as_ptr().cast::<Entry>(), capacity)
    }
}
