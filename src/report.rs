//! Structured reports, their stable text rendition, and the report sink.
//!
//! Reports exist in two forms: the structured types here (serializable
//! to JSON for machine consumers) and the fixed human-readable layout
//! that race-report consumers parse by convention:
//!
//! ```text
//! ==================
//! WARNING: ThreadSanitizer: data race
//!   Write of size 4 at 0x7b0400000010 by thread 1:
//!     #0 0x401234: worker src/worker.rs:17
//!   Previous Read of size 4 at 0x7b0400000010 by thread 0:
//!     #0 0x401180: main src/main.rs:40
//!   Location is heap of size 64 at 0x7b0400000000 allocated by thread 0:
//!     #0 0x400f00: setup src/main.rs:12
//! ==================
//! ```
//!
//! Emission is decoupled from consumption: finished reports go into a
//! bounded lock-free queue. When the queue is full the report is dropped
//! and counted; the hot path never blocks on a slow consumer.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam::queue::ArrayQueue;
use serde::{Deserialize, Serialize};

use crate::params::Tid;

/// One symbolized stack frame of a report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportFrame {
    pub pc: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
}

/// A symbolized stack trace, innermost frame first.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ReportStack {
    pub frames: Vec<ReportFrame>,
}

/// What the raced-on memory is, when the engine can tell.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MemoryLocation {
    Global {
        name: String,
        addr: u64,
        size: u64,
    },
    Heap {
        addr: u64,
        size: u64,
        alloc_tid: Tid,
        alloc_stack: ReportStack,
    },
    Stack {
        tid: Tid,
    },
    Unknown,
}

/// One memory operation of a race report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportMop {
    pub tid: Tid,
    pub write: bool,
    pub size: u64,
    pub addr: u64,
    /// `None` when the access is too old to reconstruct from the trace.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<ReportStack>,
}

/// A data-race report: the racing operations plus the target location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaceReport {
    pub mops: Vec<ReportMop>,
    pub location: MemoryLocation,
}

/// A thread alive or unjoined at finalize.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadLeakReport {
    pub tid: Tid,
    /// True if the thread never finished, false if it finished but was
    /// never joined.
    pub running: bool,
    pub creation_stack: ReportStack,
}

/// Any report the engine emits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Report {
    Race(RaceReport),
    ThreadLeak(ThreadLeakReport),
}

fn render_stack(out: &mut String, stack: &ReportStack) {
    for (i, f) in stack.frames.iter().enumerate() {
        let function = f.function.as_deref().unwrap_or("??");
        let file = f.file.as_deref().unwrap_or("??");
        let line = f.line.unwrap_or(0);
        out.push_str(&format!(
            "    #{i} 0x{:x}: {function} {file}:{line}\n",
            f.pc
        ));
    }
}

impl RaceReport {
    /// The stable text layout.
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str("==================\n");
        out.push_str("WARNING: ThreadSanitizer: data race\n");
        for (i, mop) in self.mops.iter().enumerate() {
            out.push_str(&format!(
                "  {}{} of size {} at 0x{:x} by thread {}:\n",
                if i == 0 { "" } else { "Previous " },
                if mop.write { "Write" } else { "Read" },
                mop.size,
                mop.addr,
                mop.tid,
            ));
            match &mop.stack {
                Some(stack) => render_stack(&mut out, stack),
                None => out.push_str("    [failed to restore stack]\n"),
            }
        }
        match &self.location {
            MemoryLocation::Global { name, addr, size } => {
                out.push_str(&format!(
                    "  Location is global {name} of size {size} at 0x{addr:x}\n"
                ));
            }
            MemoryLocation::Heap {
                addr,
                size,
                alloc_tid,
                alloc_stack,
            } => {
                out.push_str(&format!(
                    "  Location is heap of size {size} at 0x{addr:x} allocated by thread {alloc_tid}:\n"
                ));
                render_stack(&mut out, alloc_stack);
            }
            MemoryLocation::Stack { tid } => {
                out.push_str(&format!("  Location is stack of thread {tid}:\n"));
            }
            MemoryLocation::Unknown => {}
        }
        out.push_str("==================\n");
        out
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

impl ThreadLeakReport {
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str("==================\n");
        out.push_str(&format!(
            "WARNING: ThreadSanitizer: thread leak (thread {}, {})\n",
            self.tid,
            if self.running { "running" } else { "finished, not joined" },
        ));
        out.push_str("  Created at:\n");
        render_stack(&mut out, &self.creation_stack);
        out.push_str("==================\n");
        out
    }
}

/// Bounded lock-free queue of finished reports.
pub struct ReportSink {
    queue: ArrayQueue<Report>,
    dropped: AtomicU64,
}

impl ReportSink {
    pub fn new(capacity: usize) -> Self {
        ReportSink {
            queue: ArrayQueue::new(capacity.max(1)),
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueue a report; on a full queue the report is dropped and
    /// counted instead of blocking.
    pub fn push(&self, report: Report) {
        if self.queue.push(report).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn try_pop(&self) -> Option<Report> {
        self.queue.pop()
    }

    pub fn drain(&self) -> Vec<Report> {
        let mut out = Vec::new();
        while let Some(r) = self.queue.pop() {
            out.push(r);
        }
        out
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Recent-report ring used to suppress duplicates: a report is emitted
/// once per `(pc_a, pc_b, cell address)` key within the window.
pub struct DedupWindow {
    recent: VecDeque<(u64, u64, u64)>,
    capacity: usize,
}

impl DedupWindow {
    pub fn new(capacity: usize) -> Self {
        DedupWindow {
            recent: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// True if the key was already seen in the window; records it
    /// otherwise.
    pub fn check_and_record(&mut self, key: (u64, u64, u64)) -> bool {
        if self.capacity == 0 {
            return false;
        }
        if self.recent.contains(&key) {
            return true;
        }
        if self.recent.len() == self.capacity {
            self.recent.pop_front();
        }
        self.recent.push_back(key);
        false
    }
}
