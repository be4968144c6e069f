//! Per-thread engine state.
//!
//! Each traced thread owns exactly one [`ThreadState`], carried by its
//! event handle. The hot path reads the packed [`FastState`] word; the
//! vector clock, shadow stack and trace only come into play on epoch
//! advances and synchronization events. The trace is shared with the
//! thread's registry slot so reports can replay it after the thread is
//! gone.

use std::sync::{Arc, Mutex};

use rand::rngs::SmallRng;
use rand::SeedableRng;

use crate::clock::VectorClock;
use crate::params::Tid;
use crate::shadow::FastState;
use crate::stats::{Stat, StatSet};
use crate::trace::{EventType, Trace};

/// Marker bit on a shadow-stack entry: this frame entered a
/// recursive-ignore scope and must release it on exit. The bit lies
/// outside the 60-bit pc space recorded in traces.
pub const STACK_IGNORE_FLAG: u64 = 1 << 63;

/// State owned by one traced thread.
pub struct ThreadState {
    pub tid: Tid,
    /// Cached (tid, epoch, ignore) word read on every access.
    pub fast_state: FastState,
    /// This thread's happens-before knowledge.
    pub clock: VectorClock,
    /// Own epoch at the last synchronization operation.
    pub fast_synch_epoch: u64,
    /// PCs of the active call frames, possibly tagged with
    /// [`STACK_IGNORE_FLAG`].
    pub shadow_stack: Vec<u64>,
    /// Shared with the registry slot for post-mortem stack restoration.
    pub trace: Arc<Mutex<Trace>>,
    /// LIFO suppression tickets; nonzero means reads are not checked.
    pub ignore_reads: u32,
    /// LIFO suppression tickets; nonzero means writes are not checked.
    pub ignore_writes: u32,
    /// LIFO suppression tickets; nonzero means sync events carry no
    /// happens-before edges.
    pub ignore_sync: u32,
    /// Nonzero while engine code runs on behalf of this thread;
    /// re-entrant instrumentation events are dropped.
    pub in_rtl: u32,
    /// Call frames not recorded because the shadow stack was full;
    /// matching exits are swallowed to keep pushes and pops balanced.
    pub dropped_frames: u32,
    /// Cheap randomness for shadow-slot eviction.
    pub rng: SmallRng,
    pub stats: StatSet,
    pub stk_addr: u64,
    pub stk_size: u64,
    pub tls_addr: u64,
    pub tls_size: u64,
}

impl ThreadState {
    pub fn new(
        tid: Tid,
        epoch0: u64,
        trace: Arc<Mutex<Trace>>,
        stk: (u64, u64),
        tls: (u64, u64),
    ) -> Self {
        ThreadState {
            tid,
            fast_state: FastState::new(tid, epoch0),
            clock: VectorClock::new(),
            fast_synch_epoch: epoch0,
            shadow_stack: Vec::with_capacity(64),
            trace,
            ignore_reads: 0,
            ignore_writes: 0,
            ignore_sync: 0,
            in_rtl: 0,
            dropped_frames: 0,
            rng: SmallRng::seed_from_u64((u64::from(tid) << 40) ^ epoch0),
            stats: StatSet::new(),
            stk_addr: stk.0,
            stk_size: stk.1,
            tls_addr: tls.0,
            tls_size: tls.1,
        }
    }

    /// Advance the epoch and append the matching trace record. Every
    /// epoch increment goes through here; the trace stays exactly one
    /// record per epoch.
    pub fn increment_epoch(&mut self, typ: EventType, pc: u64) {
        self.fast_state.increment_epoch();
        self.stats.inc(Stat::Events);
        let clk = self.fast_state.epoch();
        self.trace
            .lock()
            .unwrap()
            .add_event(clk, typ, pc, &self.shadow_stack);
    }

    /// Keep the fast-path ignore bit in sync with the counters. The bit
    /// only short-circuits when both reads and writes are ignored;
    /// one-sided scopes are checked per access kind.
    pub fn update_ignore_bit(&mut self) {
        if self.ignore_reads > 0 && self.ignore_writes > 0 {
            self.fast_state.set_ignore_bit();
        } else {
            self.fast_state.clear_ignore_bit();
        }
    }

    /// Current call stack as plain pcs, marker bits stripped.
    pub fn stack_pcs(&self) -> Vec<u64> {
        self.shadow_stack
            .iter()
            .map(|&pc| pc & !STACK_IGNORE_FLAG)
            .collect()
    }

    /// Current call stack with `top_pc` appended.
    pub fn stack_with(&self, top_pc: u64) -> Vec<u64> {
        let mut pcs = self.stack_pcs();
        pcs.push(top_pc);
        pcs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> ThreadState {
        ThreadState::new(3, 10, Arc::new(Mutex::new(Trace::new())), (0, 0), (0, 0))
    }

    #[test]
    fn epoch_increment_writes_one_trace_record() {
        let mut thr = state();
        thr.increment_epoch(EventType::Mop, 0x42);
        assert_eq!(thr.fast_state.epoch(), 11);
        let trace = thr.trace.lock().unwrap();
        assert_eq!(trace.restore_stack(11), Some(vec![0x42]));
    }

    #[test]
    fn ignore_bit_needs_both_scopes() {
        let mut thr = state();
        thr.ignore_reads = 1;
        thr.update_ignore_bit();
        assert!(!thr.fast_state.ignore_bit());
        thr.ignore_writes = 1;
        thr.update_ignore_bit();
        assert!(thr.fast_state.ignore_bit());
        thr.ignore_reads = 0;
        thr.update_ignore_bit();
        assert!(!thr.fast_state.ignore_bit());
    }

    #[test]
    fn stack_pcs_strip_marker_bits() {
        let mut thr = state();
        thr.shadow_stack.push(0x100);
        thr.shadow_stack.push(0x200 | STACK_IGNORE_FLAG);
        assert_eq!(thr.stack_pcs(), vec![0x100, 0x200]);
        assert_eq!(thr.stack_with(0x300), vec![0x100, 0x200, 0x300]);
    }
}
