#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]
//! A process whose global allocator records into the same table it queries.
//!
//! The whole test binary runs on [`TrackingAllocator`]. In the parent no
//! table is published, so it only forwards. The child is this binary
//! re-executed with the table handle in its environment, so every allocation
//! it makes is recorded, including the ones table operations make while the
//! table is locked.

use std::alloc::System;
use std::process::{Command, ExitStatus};
use std::thread;
use std::time::{Duration, Instant};

use memtrace_shm::{
    AllocationRecord, SharedTable, TABLE_HANDLE_ENV, TableConfig, TableHandle, TrackingAllocator,
};

#[global_allocator]
static GLOBAL: TrackingAllocator<System> = TrackingAllocator::new(System);

/// Marks the re-executed child.
const CHILD_ENV: &str = "MEMTRACE_TEST_GLOBAL_CHILD";

const MARKER_KEY: u64 = 0x7e57;

/// Size of the block the child leaks on purpose.
const LEAKED_SIZE: usize = 4321;

/// Run the child and wait for it, killing it if it stops making progress.
fn run_child(handle: &TableHandle) -> ExitStatus {
    let exe = std::env::current_exe().expect("current exe");
    let mut child = Command::new(exe)
        .args(["child_entry", "--exact", "--nocapture", "--test-threads=1"])
        .env(TABLE_HANDLE_ENV, handle.to_string())
        .env(CHILD_ENV, "1")
        .spawn()
        .expect("spawn child");

    let deadline = Instant::now() + Duration::from_secs(30);
    loop {
        if let Some(status) = child.try_wait().expect("wait child") {
            return status;
        }
        if Instant::now() > deadline {
            let _ = child.kill();
            let _ = child.wait();
            panic!("child did not finish; a table operation blocked on its own lock");
        }
        thread::sleep(Duration::from_millis(20));
    }
}

/// Work done inside the child process; a no-op in the parent.
#[test]
fn child_entry() {
    if std::env::var_os(CHILD_ENV).is_none() {
        return;
    }
    let table = SharedTable::attach_from_env()
        .expect("attach")
        .expect("handle published");

    table
        .insert(MARKER_KEY, AllocationRecord::new(64))
        .expect("insert");

    let bare = table.scan(false).expect("scan");
    assert!(bare.blocks.iter().any(|b| b.address == MARKER_KEY));

    let full = table.scan(true).expect("scan with traces");
    let text = full.render_text(true);
    assert!(text.contains("Leaked Block Size: 64 bytes"));

    let stats = table.stats().expect("stats");
    assert!(stats.length >= 1);
    assert!(table.delete(MARKER_KEY).expect("delete"));

    std::mem::forget(vec![0u8; LEAKED_SIZE]);
}

#[test]
fn table_operations_under_global_tracking_allocator_finish() {
    if std::env::var_os(CHILD_ENV).is_some() {
        return;
    }
    let table = SharedTable::create(&TableConfig::new("globalalloc")).expect("create");

    let status = run_child(&table.handle());
    assert!(status.success(), "child failed: {status}");

    assert!(!table.contains(MARKER_KEY).expect("contains"));
    let report = table.scan(false).expect("scan");
    assert!(
        report
            .blocks
            .iter()
            .any(|b| b.block_size as usize == LEAKED_SIZE),
        "the child's leaked block should have been recorded"
    );

    table.destroy().expect("destroy");
}
