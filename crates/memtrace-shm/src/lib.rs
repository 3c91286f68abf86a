//! Cross-process allocation table for leak tracking.
//!
//! A traced program runs as a child process with an allocator override
//! loaded into it. Every allocation and deallocation it makes is recorded in
//! a hash table that lives in POSIX shared memory, and the parent process
//! inspects whatever is left in the table once the child has exited.
//!
//! The table is made of three independent shared segments:
//!
//! - **Header**: capacity step, occupancy counters, resize epoch and the
//!   handles of the other two segments
//! - **Mutex**: a process-shared `pthread_mutex_t` serializing every operation
//! - **Entries**: the open-addressing slot array, replaced on every resize
//!
//! Segments are mapped at different addresses in every process, so the
//! header only ever stores handles. Each process keeps its own resolution
//! cache and rebuilds it whenever its pid changes or a resize has replaced
//! the entries segment.
//!
//! # Example
//!
//! ```rust,no_run
//! use memtrace_shm::{AllocationRecord, SharedTable, TableConfig};
//!
//! # fn example() -> memtrace_shm::Result<()> {
//! let table = SharedTable::create(&TableConfig::default())?;
//! table.insert(0x5555_0000_1000, AllocationRecord::new(64))?;
//!
//! let report = table.scan(false)?;
//! println!("{}", report.render_text(false));
//!
//! table.destroy()?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

use thiserror::Error;

// Shared segment allocator
pub mod segment;

// Process-shared mutex
pub mod sync;

// Capacity schedule and hashing
pub mod schedule;

// Allocation records and stack capture
pub mod record;

// Per-process context resolution
mod context;

// Hash table engine
pub mod table;

// Leak scan and report rendering
pub mod report;

// Allocation interception collaborator
pub mod tracker;

// Configuration
pub mod config;

pub use config::{TableConfig, TrackerConfig};
pub use record::{AllocationRecord, FrameText, MAX_FRAMES, StackTrace};
pub use report::{LeakReport, LeakedBlock};
pub use segment::{Segment, SegmentHandle, SegmentName};
pub use table::{SharedTable, TableHandle, TableStats};
pub use tracker::{LazyTracker, ReentrancyGuard, Tracker, TrackingAllocator};

/// Result type for table operations.
pub type Result<T> = std::result::Result<T, TableError>;

/// Errors that can occur while operating on a shared table.
///
/// Key-not-found is never an error: lookups return `Option` and deletes
/// report whether anything was removed.
#[derive(Debug, Error)]
pub enum TableError {
    /// A shared segment or the shared mutex could not be created, attached,
    /// detached or destroyed.
    #[error("Shared memory error: {0}")]
    Segment(String),

    /// The key collides with a slot marker and cannot be stored.
    #[error("Reserved key: {0:#x}")]
    ReservedKey(u64),

    /// The table is at its last capacity step and has no free slot.
    #[error("Table capacity exhausted at {capacity} slots")]
    CapacityExhausted {
        /// Slot count of the last capacity step.
        capacity: u32,
    },

    /// A published table handle could not be used.
    #[error("Invalid table handle: {0}")]
    InvalidHandle(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Version information for the table layout.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Environment variable that carries the published table handle into
/// traced processes.
pub const TABLE_HANDLE_ENV: &str = "MEMTRACE_TABLE";
