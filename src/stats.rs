//! Event and shadow-processing statistics.
//!
//! Counters are accumulated per thread without synchronization and
//! merged into the engine-wide set when the thread finishes.

/// Statistic identifiers. The four size-indexed memory-op counters must
/// stay consecutive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stat {
    Mop,
    MopRead,
    MopWrite,
    Mop1,
    Mop2,
    Mop4,
    Mop8,
    MopSame,
    MopRange,
    ShadowProcessed,
    ShadowZero,
    ShadowSameSize,
    ShadowIntersect,
    ShadowNotIntersect,
    ShadowSameThread,
    ShadowAnotherThread,
    ShadowReplace,
    FuncEnter,
    FuncExit,
    Events,
    SyncCreated,
    SyncDestroyed,
    ThreadsCreated,
    ThreadsReused,
    Races,
    RacesSuppressed,
    Count,
}

const NAMES: [&str; Stat::Count as usize] = [
    "Memory accesses",
    "  Including reads",
    "            writes",
    "  Including size 1",
    "            size 2",
    "            size 4",
    "            size 8",
    "  Including same-slot repeats",
    "Range accesses",
    "Shadow slots processed",
    "  Including empty",
    "  Including same size",
    "  Including intersecting",
    "            not intersecting",
    "  Including same thread",
    "            another thread",
    "  Including evicted",
    "Function entries",
    "Function exits",
    "Events collected",
    "Sync objects created",
    "Sync objects destroyed",
    "Threads created",
    "Thread slots reused",
    "Races reported",
    "Races suppressed",
];

/// A fixed array of counters, one per [`Stat`].
#[derive(Debug, Clone)]
pub struct StatSet {
    counters: [u64; Stat::Count as usize],
}

impl StatSet {
    pub fn new() -> Self {
        StatSet {
            counters: [0; Stat::Count as usize],
        }
    }

    #[inline]
    pub fn inc(&mut self, stat: Stat) {
        self.counters[stat as usize] += 1;
    }

    #[inline]
    pub fn add(&mut self, stat: Stat, n: u64) {
        self.counters[stat as usize] += n;
    }

    /// Increment the size-indexed memory-op counter for `size_log`.
    #[inline]
    pub fn inc_mop_size(&mut self, size_log: u8) {
        self.counters[Stat::Mop1 as usize + size_log as usize] += 1;
    }

    pub fn get(&self, stat: Stat) -> u64 {
        self.counters[stat as usize]
    }

    pub fn merge(&mut self, other: &StatSet) {
        for (dst, src) in self.counters.iter_mut().zip(other.counters.iter()) {
            *dst += *src;
        }
    }

    /// Render the counter table, one line per statistic.
    pub fn summary(&self) -> String {
        let mut out = String::from("Statistics:\n");
        for (name, value) in NAMES.iter().zip(self.counters.iter()) {
            out.push_str(&format!("{name:<34}: {value}\n"));
        }
        out
    }
}

impl Default for StatSet {
    fn default() -> Self {
        StatSet::new()
    }
}
