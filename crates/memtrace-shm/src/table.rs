//! Open-addressing hash table in shared memory.
//!
//! Keys are addresses, values are [`AllocationRecord`]s. Collisions are
//! resolved with double hashing (see [`crate::schedule`]). Two key values
//! are reserved as slot markers:
//!
//! - `0` marks an empty slot, so the null pointer is never tracked
//! - `u64::MAX` marks a deleted slot
//!
//! Deleting writes the deleted marker instead of emptying the slot. A lookup
//! walks past deleted slots and only stops at an empty slot (or after one
//! full probe cycle), so keys whose probe chain crossed the deleted slot stay
//! reachable. Inserts search for the key before reusing the first deleted
//! slot they passed, which keeps keys unique. Every rebuild copies live
//! entries into a fresh zeroed segment and so drops all markers.
//!
//! The table grows by one capacity step when `length / capacity` exceeds the
//! grow threshold and shrinks by one step when it falls below the shrink
//! threshold. When live slots plus deleted markers exceed the grow threshold
//! while the live slots alone do not, the table is rebuilt at its current
//! capacity to clear the markers.

use std::fmt;
use std::mem::size_of;
use std::ptr;
use std::str::FromStr;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::TableConfig;
use crate::context::{self, ContextGuard, LocalContext};
use crate::record::AllocationRecord;
use crate::schedule::{self, CAPACITY_STEP, INITIAL_CAPACITY_INDEX, LAST_CAPACITY_INDEX, Probe};
use crate::segment::{Segment, SegmentHandle, SegmentName};
use crate::sync::SharedMutex;
use crate::{Result, TABLE_HANDLE_ENV, TableError};

/// Key of an empty slot.
pub const EMPTY_KEY: u64 = 0;

/// Key of a deleted slot.
pub const DELETED_KEY: u64 = u64::MAX;

/// Identifies a mapped table header ("MEMTRCE1").
const HEADER_MAGIC: u64 = u64::from_le_bytes(*b"MEMTRCE1");

/// Size of the header segment in bytes.
const HEADER_LEN: u64 = size_of::<TableHeader>() as u64;

/// One slot of the entries segment.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub(crate) struct Entry {
    pub(crate) key: u64,
    pub(crate) value: AllocationRecord,
}

impl Entry {
    pub(crate) const fn is_live(&self) -> bool {
        self.key != EMPTY_KEY && self.key != DELETED_KEY
    }
}

/// Table header stored in its own shared segment.
///
/// Only handles are stored here; mappings are per process.
#[derive(Debug)]
#[repr(C)]
pub(crate) struct TableHeader {
    magic: u64,
    /// Odd index into [`schedule::PRIMES`].
    pub(crate) capacity_index: u32,
    /// Number of live slots.
    pub(crate) length: u32,
    /// Number of deleted markers.
    pub(crate) tombstones: u32,
    /// Pid of the process that last resolved the table.
    pub(crate) context: u32,
    grow_load_factor: f32,
    shrink_load_factor: f32,
    /// Incremented whenever the entries segment is replaced.
    pub(crate) epoch: u64,
    /// Base name every segment of this table derives from.
    base: SegmentName,
    pub(crate) mutex: SegmentHandle,
    pub(crate) entries: SegmentHandle,
}

impl TableHeader {
    fn capacity(&self) -> u32 {
        schedule::capacity(self.capacity_index)
    }

    fn load(&self) -> f64 {
        f64::from(self.length) / f64::from(self.capacity())
    }

    fn should_grow(&self) -> bool {
        self.capacity_index < LAST_CAPACITY_INDEX
            && self.load() > f64::from(self.grow_load_factor)
    }

    fn should_shrink(&self) -> bool {
        self.capacity_index > INITIAL_CAPACITY_INDEX
            && self.load() < f64::from(self.shrink_load_factor)
    }

    fn should_purge(&self) -> bool {
        let used = f64::from(self.length + self.tombstones);
        self.tombstones > 0 && used / f64::from(self.capacity()) > f64::from(self.grow_load_factor)
    }
}

/// Where an insert lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InsertSlot {
    /// The key is already stored here.
    Existing(usize),
    /// The key is absent; store it here.
    Vacant { index: usize, reuses_marker: bool },
    /// The key is absent and no slot is free.
    Full,
}

/// Find the slot holding `key`.
fn find(entries: &[Entry], capacity_index: u32, key: u64) -> Option<usize> {
    for slot in Probe::new(key, capacity_index).slots() {
        match entries[slot].key {
            EMPTY_KEY => return None,
            k if k == key => return Some(slot),
            _ => {}
        }
    }
    None
}

/// Find the slot an insert of `key` should use.
fn locate(entries: &[Entry], capacity_index: u32, key: u64) -> InsertSlot {
    let mut first_marker = None;
    for slot in Probe::new(key, capacity_index).slots() {
        match entries[slot].key {
            EMPTY_KEY => {
                return match first_marker {
                    Some(index) => InsertSlot::Vacant {
                        index,
                        reuses_marker: true,
                    },
                    None => InsertSlot::Vacant {
                        index: slot,
                        reuses_marker: false,
                    },
                };
            }
            DELETED_KEY => {
                first_marker.get_or_insert(slot);
            }
            k if k == key => return InsertSlot::Existing(slot),
            _ => {}
        }
    }
    first_marker.map_or(InsertSlot::Full, |index| InsertSlot::Vacant {
        index,
        reuses_marker: true,
    })
}

/// Copy every live entry of `from` into the empty slot array `to`.
///
/// Returns the number of entries copied.
fn rehash(from: &[Entry], to: &mut [Entry], capacity_index: u32) -> u32 {
    let mut copied = 0;
    for entry in from.iter().filter(|e| e.is_live()) {
        let probe = Probe::new(entry.key, capacity_index);
        if let Some(slot) = probe.slots().find(|&slot| to[slot].key == EMPTY_KEY) {
            to[slot] = *entry;
            copied += 1;
        }
    }
    copied
}

fn entries_len(capacity_index: u32) -> u64 {
    u64::from(schedule::capacity(capacity_index)) * size_of::<Entry>() as u64
}

/// Published form of a table: the handle of its header segment.
///
/// Formats as the header segment name, which is what gets passed to traced
/// processes through [`TABLE_HANDLE_ENV`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableHandle(SegmentHandle);

impl TableHandle {
    /// The header segment handle.
    pub const fn segment(&self) -> &SegmentHandle {
        &self.0
    }
}

impl fmt::Display for TableHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0.name, f)
    }
}

impl FromStr for TableHandle {
    type Err = TableError;

    fn from_str(s: &str) -> Result<Self> {
        let name = SegmentName::new(s.trim())?;
        Ok(Self(SegmentHandle::new(name, HEADER_LEN)))
    }
}

/// Snapshot of a table's occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TableStats {
    /// Live entries.
    pub length: u32,
    /// Deleted markers awaiting the next rebuild.
    pub tombstones: u32,
    /// Slot count.
    pub capacity: u32,
    /// Position in the capacity schedule.
    pub capacity_index: u32,
    /// Number of times the entries segment has been replaced.
    pub epoch: u64,
}

/// Direction of a rebuild.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resize {
    Grow,
    Shrink,
    Purge,
}

/// Handle to a shared allocation table mapped into this process.
///
/// Every operation takes the table's shared mutex for its full duration, so
/// calls from any thread of any attached process are totally ordered.
/// Dropping a `SharedTable` only detaches it; [`SharedTable::destroy`]
/// removes the segments.
pub struct SharedTable {
    header: Segment,
    local: Mutex<LocalContext>,
    owner: bool,
}

impl SharedTable {
    /// Create a new table and its three segments.
    #[allow(unsafe_code)]
    pub fn create(config: &TableConfig) -> Result<Self> {
        config.validate()?;

        let base = SegmentName::unique(&config.segment_prefix)?;
        let header_handle = SegmentHandle::new(base.derive("table")?, HEADER_LEN);
        let mutex_name = base.derive("mutex")?;
        let entries_handle = SegmentHandle::new(
            base.derive_epoch("entries", 0)?,
            entries_len(INITIAL_CAPACITY_INDEX),
        );

        let header = Segment::allocate(header_handle)?;
        let mutex = match SharedMutex::create(mutex_name) {
            Ok(mutex) => mutex,
            Err(e) => {
                let _ = header.release();
                return Err(e);
            }
        };
        let entries = match Segment::allocate(entries_handle) {
            Ok(entries) => entries,
            Err(e) => {
                let _ = mutex.destroy();
                let _ = header.release();
                return Err(e);
            }
        };

        let initial = TableHeader {
            magic: HEADER_MAGIC,
            capacity_index: INITIAL_CAPACITY_INDEX,
            length: 0,
            tombstones: 0,
            context: std::process::id(),
            grow_load_factor: config.grow_load_factor,
            shrink_load_factor: config.shrink_load_factor,
            epoch: 0,
            base,
            mutex: *mutex.handle(),
            entries: entries_handle,
        };
        // SAFETY: the header segment is freshly mapped, page-aligned and
        // `HEADER_LEN` bytes long; nobody else knows its name yet.
        unsafe { header.as_ptr().cast::<TableHeader>().write(initial) };

        info!(
            "Created table {} ({} slots)",
            header_handle.name,
            schedule::capacity(INITIAL_CAPACITY_INDEX)
        );

        Ok(Self {
            header,
            local: Mutex::new(LocalContext::resolved(mutex, entries, 0)),
            owner: true,
        })
    }

    /// Attach to a table created by another process.
    #[allow(unsafe_code)]
    pub fn attach(handle: &TableHandle) -> Result<Self> {
        let header = Segment::resolve(handle.segment())?;

        // SAFETY: the segment is at least `HEADER_LEN` bytes long and the
        // magic is the first field of a page-aligned `TableHeader`.
        let (magic, capacity_index) = unsafe {
            let raw = header.as_ptr().cast::<TableHeader>();
            (
                ptr::addr_of!((*raw).magic).read(),
                ptr::addr_of!((*raw).capacity_index).read(),
            )
        };
        if magic != HEADER_MAGIC || !schedule::is_capacity_index(capacity_index) {
            return Err(TableError::InvalidHandle(format!(
                "{handle} does not hold a table header"
            )));
        }

        info!("Attached to table {handle}");
        Ok(Self {
            header,
            local: Mutex::new(LocalContext::default()),
            owner: false,
        })
    }

    /// Attach to the table published in [`TABLE_HANDLE_ENV`].
    ///
    /// Returns `Ok(None)` when no table is published.
    pub fn attach_from_env() -> Result<Option<Self>> {
        let Some(value) = std::env::var_os(TABLE_HANDLE_ENV) else {
            return Ok(None);
        };
        let value = value.to_str().ok_or_else(|| {
            TableError::InvalidHandle(format!("{TABLE_HANDLE_ENV} is not valid UTF-8"))
        })?;
        let handle: TableHandle = value.parse()?;
        Self::attach(&handle).map(Some)
    }

    /// The handle other processes attach with.
    pub fn handle(&self) -> TableHandle {
        TableHandle(*self.header.handle())
    }

    /// Whether this process created the table.
    pub const fn is_owner(&self) -> bool {
        self.owner
    }

    /// Insert or overwrite the record for `key`.
    pub fn insert(&self, key: u64, record: AllocationRecord) -> Result<()> {
        if key == EMPTY_KEY || key == DELETED_KEY {
            return Err(TableError::ReservedKey(key));
        }

        let mut ctx = self.acquire()?;
        let (header, entries) = ctx.split_mut();

        match locate(entries, header.capacity_index, key) {
            InsertSlot::Existing(index) => {
                entries[index].value = record;
                return Ok(());
            }
            InsertSlot::Vacant {
                index,
                reuses_marker,
            } => {
                entries[index] = Entry { key, value: record };
                header.length += 1;
                if reuses_marker {
                    header.tombstones -= 1;
                }
            }
            InsertSlot::Full => {
                return Err(TableError::CapacityExhausted {
                    capacity: header.capacity(),
                });
            }
        }

        if header.should_grow() {
            Self::rebuild(&mut ctx, Resize::Grow)?;
        } else if header.should_purge() {
            Self::rebuild(&mut ctx, Resize::Purge)?;
        }
        Ok(())
    }

    /// Remove the record for `key`.
    ///
    /// Returns whether a record was removed; an absent key is not an error.
    pub fn delete(&self, key: u64) -> Result<bool> {
        if key == EMPTY_KEY || key == DELETED_KEY {
            return Ok(false);
        }

        let mut ctx = self.acquire()?;
        let (header, entries) = ctx.split_mut();

        let Some(index) = find(entries, header.capacity_index, key) else {
            return Ok(false);
        };
        entries[index] = Entry {
            key: DELETED_KEY,
            value: AllocationRecord::default(),
        };
        header.length -= 1;
        header.tombstones += 1;

        if header.should_shrink() {
            Self::rebuild(&mut ctx, Resize::Shrink)?;
        } else if header.should_purge() {
            Self::rebuild(&mut ctx, Resize::Purge)?;
        }
        Ok(true)
    }

    /// Copy of the record stored for `key`.
    pub fn get(&self, key: u64) -> Result<Option<AllocationRecord>> {
        if key == EMPTY_KEY || key == DELETED_KEY {
            return Ok(None);
        }

        let ctx = self.acquire()?;
        let index = find(ctx.entries(), ctx.header().capacity_index, key);
        Ok(index.map(|i| ctx.entries()[i].value))
    }

    /// Whether a record is stored for `key`.
    pub fn contains(&self, key: u64) -> Result<bool> {
        self.get(key).map(|record| record.is_some())
    }

    /// Occupancy snapshot.
    pub fn stats(&self) -> Result<TableStats> {
        let ctx = self.acquire()?;
        let header = ctx.header();
        Ok(TableStats {
            length: header.length,
            tombstones: header.tombstones,
            capacity: header.capacity(),
            capacity_index: header.capacity_index,
            epoch: header.epoch,
        })
    }

    /// Number of live records.
    pub fn len(&self) -> Result<u32> {
        self.stats().map(|s| s.length)
    }

    /// Whether the table holds no records.
    pub fn is_empty(&self) -> Result<bool> {
        self.len().map(|len| len == 0)
    }

    /// Current slot count.
    pub fn capacity(&self) -> Result<u32> {
        self.stats().map(|s| s.capacity)
    }

    /// Current position in the capacity schedule.
    pub fn capacity_index(&self) -> Result<u32> {
        self.stats().map(|s| s.capacity_index)
    }

    /// Destroy the mutex and release all three segments.
    ///
    /// Only the creating process may destroy a table, and no other process
    /// may be using it. Every step is attempted even if an earlier one
    /// fails; the first error is returned.
    pub fn destroy(self) -> Result<()> {
        if !self.owner {
            return Err(TableError::Segment(format!(
                "table {} was not created by this process",
                self.handle()
            )));
        }

        // Make sure the cached mappings belong to this process.
        drop(self.acquire()?);

        let name = self.header.handle().name;
        let Self { header, local, .. } = self;
        let (mutex, entries) = local.into_inner().into_parts();

        let mut result = Ok(());
        let mut record = |step: Result<()>| {
            if let Err(e) = step {
                warn!("Table teardown step failed: {e}");
                if result.is_ok() {
                    result = Err(e);
                }
            }
        };

        match mutex.and_then(std::sync::Arc::into_inner) {
            Some(mutex) => record(mutex.destroy()),
            None => record(Err(TableError::Segment(format!(
                "mutex of {name} is still in use"
            )))),
        }
        if let Some(entries) = entries {
            record(entries.release());
        }
        record(header.release());

        info!("Destroyed table {name}");
        result
    }

    pub(crate) fn acquire(&self) -> Result<ContextGuard<'_>> {
        context::acquire(&self.local, self.header.as_ptr().cast::<TableHeader>())
    }

    /// Move every live entry into a freshly allocated entries segment.
    ///
    /// The new segment is allocated and filled before the old one is
    /// released, so a failed allocation leaves the table untouched. Nothing
    /// here allocates on the heap.
    fn rebuild(ctx: &mut ContextGuard<'_>, direction: Resize) -> Result<()> {
        let header = ctx.header();
        let old_index = header.capacity_index;
        let new_index = match direction {
            Resize::Grow => old_index + CAPACITY_STEP,
            Resize::Shrink => old_index - CAPACITY_STEP,
            Resize::Purge => old_index,
        };
        let epoch = header.epoch + 1;
        let handle = SegmentHandle::new(
            header.base.derive_epoch("entries", epoch)?,
            entries_len(new_index),
        );

        let mut segment = Segment::allocate(handle)?;
        let new_capacity = schedule::capacity(new_index) as usize;
        let copied = rehash(
            ctx.entries(),
            context::entry_slice_mut(&mut segment, new_capacity),
            new_index,
        );
        debug_assert_eq!(copied, ctx.header().length);

        if let Some(old) = ctx.install_entries(segment, new_index, epoch)
            && let Err(e) = old.release()
        {
            warn!("Failed to release replaced entries segment: {e}");
        }

        debug!(
            "{direction:?}: table {} resized from {} to {} slots (epoch {epoch})",
            ctx.header().base,
            schedule::capacity(old_index),
            new_capacity
        );
        Ok(())
    }
}

impl fmt::Debug for SharedTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedTable")
            .field("handle", &self.handle())
            .field("owner", &self.owner)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;

    fn slots(capacity_index: u32) -> Vec<Entry> {
        vec![
            Entry {
                key: EMPTY_KEY,
                value: AllocationRecord::default(),
            };
            schedule::capacity(capacity_index) as usize
        ]
    }

    fn put(entries: &mut [Entry], key: u64, size: u32) {
        match locate(entries, INITIAL_CAPACITY_INDEX, key) {
            InsertSlot::Vacant { index, .. } | InsertSlot::Existing(index) => {
                entries[index] = Entry {
                    key,
                    value: AllocationRecord::new(size),
                };
            }
            InsertSlot::Full => panic!("table full"),
        }
    }

    /// Two distinct keys sharing their first probe slot.
    fn colliding_pair() -> (u64, u64) {
        let first = 1u64;
        let target = Probe::new(first, INITIAL_CAPACITY_INDEX).slot(0);
        let second = (2..)
            .find(|&k| Probe::new(k, INITIAL_CAPACITY_INDEX).slot(0) == target)
            .expect("collision");
        (first, second)
    }

    #[test]
    fn test_find_walks_past_deleted_marker() {
        let (a, b) = colliding_pair();
        let mut entries = slots(INITIAL_CAPACITY_INDEX);
        put(&mut entries, a, 1);
        put(&mut entries, b, 2);

        let a_slot = find(&entries, INITIAL_CAPACITY_INDEX, a).expect("a");
        entries[a_slot].key = DELETED_KEY;

        let b_slot = find(&entries, INITIAL_CAPACITY_INDEX, b).expect("b still reachable");
        assert_eq!(entries[b_slot].value.block_size, 2);
        assert_eq!(find(&entries, INITIAL_CAPACITY_INDEX, a), None);
    }

    #[test]
    fn test_locate_prefers_existing_over_marker() {
        let (a, b) = colliding_pair();
        let mut entries = slots(INITIAL_CAPACITY_INDEX);
        put(&mut entries, a, 1);
        put(&mut entries, b, 2);
        let a_slot = find(&entries, INITIAL_CAPACITY_INDEX, a).expect("a");
        entries[a_slot].key = DELETED_KEY;

        let b_slot = find(&entries, INITIAL_CAPACITY_INDEX, b).expect("b");
        assert_eq!(
            locate(&entries, INITIAL_CAPACITY_INDEX, b),
            InsertSlot::Existing(b_slot)
        );

        // A new colliding key takes over the marker
        let c = (b + 1..)
            .find(|&k| {
                Probe::new(k, INITIAL_CAPACITY_INDEX).slot(0)
                    == Probe::new(a, INITIAL_CAPACITY_INDEX).slot(0)
            })
            .expect("collision");
        assert_eq!(
            locate(&entries, INITIAL_CAPACITY_INDEX, c),
            InsertSlot::Vacant {
                index: a_slot,
                reuses_marker: true
            }
        );
    }

    #[test]
    fn test_locate_full_table() {
        let mut entries = slots(INITIAL_CAPACITY_INDEX);
        for (i, entry) in entries.iter_mut().enumerate() {
            entry.key = i as u64 + 1;
        }
        assert_eq!(locate(&entries, INITIAL_CAPACITY_INDEX, 10_000), InsertSlot::Full);
        assert_eq!(find(&entries, INITIAL_CAPACITY_INDEX, 10_000), None);
        assert!(matches!(
            locate(&entries, INITIAL_CAPACITY_INDEX, 5),
            InsertSlot::Existing(_)
        ));
    }

    #[test]
    fn test_rehash_moves_only_live_entries() {
        let mut old = slots(INITIAL_CAPACITY_INDEX);
        for key in 1..=50 {
            put(&mut old, key, key as u32);
        }
        let gone = find(&old, INITIAL_CAPACITY_INDEX, 7).expect("7");
        old[gone].key = DELETED_KEY;

        let next = INITIAL_CAPACITY_INDEX + CAPACITY_STEP;
        let mut new = slots(next);
        assert_eq!(rehash(&old, &mut new, next), 49);
        assert!(new.iter().all(|e| e.key != DELETED_KEY));
        for key in (1..=50).filter(|&k| k != 7) {
            let slot = find(&new, next, key).expect("rehashed");
            assert_eq!(new[slot].value.block_size, key as u32);
        }
        assert_eq!(find(&new, next, 7), None);
    }

    #[test]
    fn test_handle_round_trip() {
        let handle: TableHandle = "/memtrace.1.ff.table".parse().expect("parse");
        assert_eq!(handle.to_string(), "/memtrace.1.ff.table");
        assert_eq!(handle.segment().len, HEADER_LEN);
        assert!("no-slash".parse::<TableHandle>().is_err());
    }

    #[test]
    fn test_header_fits_in_one_page() {
        assert!(HEADER_LEN <= 4096);
        assert_eq!(size_of::<Entry>() % 8, 0);
    }
}
