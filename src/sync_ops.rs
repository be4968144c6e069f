//! Synchronization event handlers.
//!
//! Every user-level synchronization primitive reduces to the same two
//! moves against the address's [`SyncVar`](crate::sync::SyncVar) clock:
//! the releasing side (unlock, signal, post, barrier arrival) merges its
//! clock into the object; the acquiring side (lock, wake-up, wait
//! return) merges the object's clock into its own. Mutexes additionally
//! track ownership and recursion so misuse can be diagnosed without
//! stopping the program.
//!
//! Each handler advances the thread's epoch and appends the matching
//! trace record even when the `ignore_sync` counter suppresses the
//! happens-before edge itself, keeping the one-record-per-epoch trace
//! invariant unconditional.

use tracing::{debug, warn};

use crate::engine::Engine;
use crate::state::ThreadState;
use crate::stats::Stat;
use crate::sync::SyncState;
use crate::trace::EventType;

impl Engine {
    /// Publish `thr`'s clock into `st`, updating the thread's own entry
    /// first. The caller holds the SyncVar's write lock.
    pub(crate) fn release_clock(&self, thr: &mut ThreadState, st: &mut SyncState) {
        let clk = thr.fast_state.epoch();
        thr.clock.set(thr.tid, clk);
        thr.fast_synch_epoch = clk;
        thr.clock.release(&mut st.clock);
    }

    fn acquire_clock(&self, thr: &mut ThreadState, st: &SyncState) {
        let clk = thr.fast_state.epoch();
        thr.clock.set(thr.tid, clk);
        thr.clock.acquire(&st.clock);
    }

    pub(crate) fn mutex_create(
        &self,
        thr: &mut ThreadState,
        pc: u64,
        addr: u64,
        is_rw: bool,
        is_recursive: bool,
    ) {
        thr.stats.inc(Stat::SyncCreated);
        let sv = self.sync_tab.get_or_create(addr, || thr.stack_with(pc));
        let mut st = sv.state.write().unwrap();
        st.is_rw = is_rw;
        st.is_recursive = is_recursive;
        debug!(tid = thr.tid, addr, is_rw, is_recursive, "mutex create");
    }

    pub(crate) fn mutex_destroy(&self, thr: &mut ThreadState, pc: u64, addr: u64) {
        let _ = pc;
        thr.stats.inc(Stat::SyncDestroyed);
        match self.sync_tab.get_and_remove(addr) {
            Some(sv) => {
                let st = sv.state.read().unwrap();
                if st.owner_tid.is_some() {
                    warn!(tid = thr.tid, addr, "destroy of a locked mutex");
                }
            }
            None => warn!(tid = thr.tid, addr, "destroy of an unknown mutex"),
        }
    }

    pub(crate) fn mutex_lock(&self, thr: &mut ThreadState, pc: u64, addr: u64, write: bool) {
        thr.increment_epoch(EventType::Lock, pc);
        let sv = self.sync_tab.get_or_create(addr, || thr.stack_with(pc));
        let mut st = sv.state.write().unwrap();
        if write {
            if st.owner_tid == Some(thr.tid) {
                if st.is_recursive {
                    st.recursion += 1;
                } else if !st.is_broken {
                    st.is_broken = true;
                    warn!(tid = thr.tid, addr, "double lock of a non-recursive mutex");
                }
            } else {
                if st.owner_tid.is_some() && !st.is_broken {
                    st.is_broken = true;
                    warn!(
                        tid = thr.tid,
                        addr,
                        owner = ?st.owner_tid,
                        "lock of a mutex held by another thread"
                    );
                }
                st.owner_tid = Some(thr.tid);
                st.recursion = 1;
            }
        }
        if thr.ignore_sync == 0 {
            self.acquire_clock(thr, &st);
        }
    }

    pub(crate) fn mutex_unlock(&self, thr: &mut ThreadState, pc: u64, addr: u64, write: bool) {
        thr.increment_epoch(EventType::Unlock, pc);
        let sv = self.sync_tab.get_or_create(addr, || thr.stack_with(pc));
        let mut st = sv.state.write().unwrap();
        if write {
            if st.owner_tid != Some(thr.tid) {
                if !st.is_broken {
                    st.is_broken = true;
                    warn!(
                        tid = thr.tid,
                        addr,
                        owner = ?st.owner_tid,
                        "unlock of a mutex the thread does not hold"
                    );
                }
            } else {
                st.recursion -= 1;
                if st.recursion > 0 {
                    // Inner recursive unlock: ownership and the
                    // happens-before edge stay with the outer one.
                    return;
                }
                st.owner_tid = None;
            }
        }
        if thr.ignore_sync == 0 {
            self.release_clock(thr, &mut st);
        }
    }

    pub(crate) fn cond_signal(&self, thr: &mut ThreadState, pc: u64, addr: u64) {
        thr.increment_epoch(EventType::Unlock, pc);
        if thr.ignore_sync > 0 {
            return;
        }
        let sv = self.sync_tab.get_or_create(addr, || thr.stack_with(pc));
        let mut st = sv.state.write().unwrap();
        self.release_clock(thr, &mut st);
    }

    /// The waiter atomically releases the mutex while parking; the cond
    /// address itself carries no edge on this side.
    pub(crate) fn cond_wait_before(&self, thr: &mut ThreadState, pc: u64, cond: u64, mtx: u64) {
        let _ = cond;
        self.mutex_unlock(thr, pc, mtx, true);
    }

    pub(crate) fn cond_wait_after(&self, thr: &mut ThreadState, pc: u64, cond: u64) {
        thr.increment_epoch(EventType::Lock, pc);
        if thr.ignore_sync > 0 {
            return;
        }
        let sv = self.sync_tab.get_or_create(cond, || thr.stack_with(pc));
        let st = sv.state.read().unwrap();
        self.acquire_clock(thr, &st);
    }

    pub(crate) fn sem_post(&self, thr: &mut ThreadState, pc: u64, addr: u64) {
        self.cond_signal(thr, pc, addr);
    }

    pub(crate) fn sem_wait(&self, thr: &mut ThreadState, pc: u64, addr: u64) {
        self.cond_wait_after(thr, pc, addr);
    }

    pub(crate) fn barrier_init(&self, thr: &mut ThreadState, pc: u64, addr: u64, count: u32) {
        let sv = self.sync_tab.get_or_create(addr, || thr.stack_with(pc));
        let mut st = sv.state.write().unwrap();
        st.barrier_count = count;
        st.barrier_arrived = 0;
        debug!(tid = thr.tid, addr, count, "barrier init");
    }

    /// Arrival: release into the barrier's clock. Once every party has
    /// arrived the round counter resets; the accumulated clock already
    /// dominates all arrivals, which is exactly what departures acquire.
    pub(crate) fn barrier_wait_before(&self, thr: &mut ThreadState, pc: u64, addr: u64) {
        thr.increment_epoch(EventType::Unlock, pc);
        let sv = self.sync_tab.get_or_create(addr, || thr.stack_with(pc));
        let mut st = sv.state.write().unwrap();
        st.barrier_arrived += 1;
        if st.barrier_count > 0 && st.barrier_arrived >= st.barrier_count {
            st.barrier_arrived = 0;
        }
        if thr.ignore_sync == 0 {
            self.release_clock(thr, &mut st);
        }
    }

    pub(crate) fn barrier_wait_after(&self, thr: &mut ThreadState, pc: u64, addr: u64) {
        thr.increment_epoch(EventType::Lock, pc);
        if thr.ignore_sync > 0 {
            return;
        }
        let sv = self.sync_tab.get_or_create(addr, || thr.stack_with(pc));
        let st = sv.state.read().unwrap();
        self.acquire_clock(thr, &st);
    }
}
