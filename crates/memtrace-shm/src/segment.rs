//! Shared segment allocator on POSIX shared memory.
//!
//! A segment is identified system-wide by a [`SegmentHandle`]: a fixed-size
//! name plus the segment length. Handles are plain `#[repr(C)]` data, so they
//! can be stored inside other segments and copied between processes. Turning
//! a handle into memory the caller can touch is *resolution*, and it yields a
//! mapping that is only valid in the resolving process.
//!
//! Segments are created with `shm_open(O_CREAT | O_EXCL)` and mode 0600, sized
//! with `ftruncate` and mapped `MAP_SHARED` through `memmap2`. The descriptor
//! is closed as soon as the mapping exists. New segments are zero-filled by
//! the kernel.

use std::fmt::{self, Write as _};
use std::fs::File;
use std::os::unix::io::FromRawFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use libc::{O_CREAT, O_EXCL, O_RDWR, S_IRUSR, S_IWUSR};
use libc::{c_char, c_uint, mode_t};
use memmap2::{MmapOptions, MmapRaw};
use tracing::trace;

use crate::{Result, TableError};

/// Capacity of a segment name buffer, including the trailing NUL.
pub const SEGMENT_NAME_LEN: usize = 96;

/// Per-process counter mixed into generated names.
static NAME_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Fixed-size, NUL-terminated POSIX shared memory name.
///
/// Always starts with `/` and contains no other `/`. Building and printing a
/// name never touches the heap, which keeps segment handling usable from
/// inside an allocator hook.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct SegmentName([u8; SEGMENT_NAME_LEN]);

impl SegmentName {
    /// Validate and copy a name.
    pub fn new(name: &str) -> Result<Self> {
        let Some(rest) = name.strip_prefix('/') else {
            return Err(TableError::InvalidHandle(format!(
                "segment name must start with '/': {name}"
            )));
        };
        if rest.is_empty() || rest.contains('/') || name.contains('\0') {
            return Err(TableError::InvalidHandle(format!(
                "malformed segment name: {name}"
            )));
        }

        let mut writer = NameWriter::new();
        writer
            .write_str(name)
            .map_err(|_| TableError::InvalidHandle(format!("segment name too long: {name}")))?;
        Ok(writer.finish())
    }

    /// Generate a fresh base name `/<prefix>.<pid>.<nonce>`.
    ///
    /// The nonce combines the wall clock with a per-process counter so that
    /// tables created back to back (or from parallel threads) never collide.
    pub fn unique(prefix: &str) -> Result<Self> {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_nanos() as u64);
        let count = NAME_COUNTER.fetch_add(1, Ordering::Relaxed);
        let nonce = nanos.rotate_left(17) ^ count.wrapping_mul(0x9E37_79B9_7F4A_7C15);

        let mut writer = NameWriter::new();
        write!(writer, "/{prefix}.{}.{nonce:016x}", std::process::id())
            .map_err(|_| TableError::Config(format!("segment prefix too long: {prefix}")))?;
        Ok(writer.finish())
    }

    /// Derive a role-specific name, e.g. `/memtrace.42.00ff.mutex`.
    pub fn derive(&self, role: &str) -> Result<Self> {
        let mut writer = NameWriter::new();
        write!(writer, "{}.{role}", self.as_str()).map_err(|_| self.overflow(role))?;
        Ok(writer.finish())
    }

    /// Derive a role-specific name that also carries a generation number.
    pub fn derive_epoch(&self, role: &str, epoch: u64) -> Result<Self> {
        let mut writer = NameWriter::new();
        write!(writer, "{}.{role}.{epoch}", self.as_str()).map_err(|_| self.overflow(role))?;
        Ok(writer.finish())
    }

    /// The name as a string slice (without the trailing NUL).
    pub fn as_str(&self) -> &str {
        let end = self.0.iter().position(|&b| b == 0).unwrap_or(SEGMENT_NAME_LEN);
        std::str::from_utf8(&self.0[..end]).unwrap_or_default()
    }

    fn as_c_ptr(&self) -> *const c_char {
        self.0.as_ptr().cast()
    }

    fn overflow(&self, role: &str) -> TableError {
        TableError::Segment(format!("derived name for {role} too long: {}", self.as_str()))
    }
}

impl fmt::Display for SegmentName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for SegmentName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SegmentName({:?})", self.as_str())
    }
}

/// Stack buffer that formats a name and keeps room for the NUL.
struct NameWriter {
    buf: [u8; SEGMENT_NAME_LEN],
    len: usize,
}

impl NameWriter {
    const fn new() -> Self {
        Self {
            buf: [0; SEGMENT_NAME_LEN],
            len: 0,
        }
    }

    const fn finish(self) -> SegmentName {
        SegmentName(self.buf)
    }
}

impl fmt::Write for NameWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let end = self.len + s.len();
        if end >= SEGMENT_NAME_LEN {
            return Err(fmt::Error);
        }
        self.buf[self.len..end].copy_from_slice(s.as_bytes());
        self.len = end;
        Ok(())
    }
}

/// Process-portable reference to a shared segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct SegmentHandle {
    /// System-wide segment name.
    pub name: SegmentName,
    /// Segment length in bytes.
    pub len: u64,
}

impl SegmentHandle {
    /// Create a handle from a name and a length.
    pub const fn new(name: SegmentName, len: u64) -> Self {
        Self { name, len }
    }
}

/// A shared segment mapped into the current process.
///
/// Dropping a `Segment` detaches the mapping but leaves the segment itself in
/// place for other processes. [`Segment::release`] detaches and destroys it.
pub struct Segment {
    handle: SegmentHandle,
    map: MmapRaw,
}

impl Segment {
    /// Create a new zero-filled segment and map it.
    ///
    /// Fails if a segment with the same name already exists.
    pub fn allocate(handle: SegmentHandle) -> Result<Self> {
        let file = shm_open(&handle.name, O_CREAT | O_EXCL | O_RDWR)?;

        if let Err(e) = file.set_len(handle.len) {
            let _ = unlink(&handle.name);
            return Err(TableError::Segment(format!(
                "ftruncate failed for {}: {e}",
                handle.name
            )));
        }

        match map(&file, &handle) {
            Ok(map) => {
                trace!("Allocated segment {} ({} bytes)", handle.name, handle.len);
                Ok(Self { handle, map })
            }
            Err(e) => {
                let _ = unlink(&handle.name);
                Err(e)
            }
        }
    }

    /// Map an existing segment into the current process.
    pub fn resolve(handle: &SegmentHandle) -> Result<Self> {
        let file = shm_open(&handle.name, O_RDWR)?;

        let actual = file
            .metadata()
            .map_err(|e| TableError::Segment(format!("fstat failed for {}: {e}", handle.name)))?
            .len();
        if actual < handle.len {
            return Err(TableError::Segment(format!(
                "segment {} is {actual} bytes, expected {}",
                handle.name, handle.len
            )));
        }

        let map = map(&file, handle)?;
        trace!("Resolved segment {} at {:p}", handle.name, map.as_ptr());
        Ok(Self {
            handle: *handle,
            map,
        })
    }

    /// Detach the mapping and destroy the segment.
    pub fn release(self) -> Result<()> {
        let name = self.handle.name;
        drop(self);
        unlink(&name)
    }

    /// Base address of the mapping in this process.
    pub fn as_ptr(&self) -> *mut u8 {
        self.map.as_mut_ptr()
    }

    /// Mapped length in bytes.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Whether the mapping is empty (never true for a live segment).
    pub fn is_empty(&self) -> bool {
        self.map.len() == 0
    }

    /// The handle this segment was allocated or resolved from.
    pub const fn handle(&self) -> &SegmentHandle {
        &self.handle
    }
}

impl fmt::Debug for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Segment")
            .field("name", &self.handle.name)
            .field("len", &self.handle.len)
            .field("addr", &self.map.as_ptr())
            .finish()
    }
}

/// Remove a segment name from the system.
///
/// Existing mappings stay valid until they are detached.
#[allow(unsafe_code)]
pub fn unlink(name: &SegmentName) -> Result<()> {
    // SAFETY: `SegmentName` is always NUL-terminated.
    if unsafe { libc::shm_unlink(name.as_c_ptr()) } == -1 {
        return Err(TableError::Segment(format!(
            "shm_unlink failed for {name}: {}",
            std::io::Error::last_os_error()
        )));
    }
    trace!("Unlinked segment {name}");
    Ok(())
}

#[allow(unsafe_code)]
fn shm_open(name: &SegmentName, flags: libc::c_int) -> Result<File> {
    // SAFETY: `SegmentName` is always NUL-terminated.
    let fd = unsafe {
        libc::shm_open(
            name.as_c_ptr(),
            flags,
            (S_IRUSR | S_IWUSR) as mode_t as c_uint,
        )
    };

    if fd == -1 {
        return Err(TableError::Segment(format!(
            "shm_open failed for {name}: {}",
            std::io::Error::last_os_error()
        )));
    }

    // SAFETY: `fd` was just returned by shm_open and is owned by nobody else.
    Ok(unsafe { File::from_raw_fd(fd) })
}

fn map(file: &File, handle: &SegmentHandle) -> Result<MmapRaw> {
    let len = usize::try_from(handle.len).map_err(|_| {
        TableError::Segment(format!("segment {} too large to map", handle.name))
    })?;

    MmapOptions::new()
        .len(len)
        .map_raw(file)
        .map_err(|e| TableError::Segment(format!("mmap failed for {}: {e}", handle.name)))
}
