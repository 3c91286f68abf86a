//! Leak scan and report rendering.

use std::fmt::Write as _;

use serde::Serialize;
use tracing::debug;

use crate::Result;
use crate::table::SharedTable;

const SEPARATOR: &str = "--------------------------------------------------------------";

/// One allocation still live when the table was scanned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LeakedBlock {
    /// Block address in the process that allocated it.
    pub address: u64,
    /// Requested size in bytes.
    pub block_size: u32,
    /// Frame descriptors, innermost first. Empty unless traces were collected.
    pub stack_trace: Vec<String>,
}

/// Everything left in a table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LeakReport {
    /// Sum of all leaked block sizes.
    pub leaked_bytes: u64,
    /// Number of leaked blocks.
    pub leaked_blocks: u64,
    /// Leaked blocks ordered by address.
    pub blocks: Vec<LeakedBlock>,
}

impl LeakReport {
    /// Build a report from blocks in any order.
    pub fn from_blocks(mut blocks: Vec<LeakedBlock>) -> Self {
        blocks.sort_by_key(|b| b.address);
        Self {
            leaked_bytes: blocks.iter().map(|b| u64::from(b.block_size)).sum(),
            leaked_blocks: blocks.len() as u64,
            blocks,
        }
    }

    /// Whether nothing leaked.
    pub const fn is_clean(&self) -> bool {
        self.leaked_blocks == 0
    }

    /// Human readable report.
    ///
    /// With `show_stacks`, every block is listed with its frames and a hint
    /// on how to map the innermost address back to source. The summary line
    /// is always present.
    pub fn render_text(&self, show_stacks: bool) -> String {
        let mut out = String::new();

        if show_stacks {
            for block in &self.blocks {
                let _ = writeln!(out, "\nLeaked Block Size: {} bytes", block.block_size);
                out.push_str("Leaked Block Stack Trace:\n\n");
                for frame in &block.stack_trace {
                    let _ = writeln!(out, "# {frame}");
                }
                out.push_str("\nTo track down the leak run:\n");
                out.push_str("objdump -S <executable> | grep -A 10 -B 10 '<top-base-offset>'\n");
                out.push_str("addr2line -e <executable> <top-base-offset>\n\n");
                out.push_str(SEPARATOR);
                out.push('\n');
            }
        }

        if self.is_clean() {
            out.push_str("\nNo memory leaks\n\n");
        } else {
            let _ = writeln!(
                out,
                "{} bytes not freed in {} blocks\n",
                self.leaked_bytes, self.leaked_blocks
            );
        }
        out
    }

    /// Pretty-printed JSON.
    pub fn to_json_pretty(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

impl SharedTable {
    /// Walk every slot and report the live records.
    ///
    /// The table is locked for the whole walk and left unchanged. Frame
    /// descriptors are only copied out when `collect_traces` is set.
    pub fn scan(&self, collect_traces: bool) -> Result<LeakReport> {
        let blocks: Vec<LeakedBlock> = {
            let ctx = self.acquire()?;
            ctx.entries()
                .iter()
                .filter(|e| e.is_live())
                .map(|e| LeakedBlock {
                    address: e.key,
                    block_size: e.value.block_size,
                    stack_trace: if collect_traces {
                        e.value.stack_trace.frames().map(str::to_owned).collect()
                    } else {
                        Vec::new()
                    },
                })
                .collect()
        };

        let report = LeakReport::from_blocks(blocks);
        debug!(
            "Scanned table {}: {} blocks, {} bytes",
            self.handle(),
            report.leaked_blocks,
            report.leaked_bytes
        );
        Ok(report)
    }
}
