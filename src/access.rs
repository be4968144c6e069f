//! The access handler: the hot path of the detector.
//!
//! Every instrumented load and store funnels into [`Engine::memory_access`]:
//!
//! 1. Bail out early on ignore bits; this is the common case inside
//!    ignored scopes and must stay a handful of instructions.
//! 2. Advance the thread's epoch and append the matching trace record.
//! 3. Build a candidate slot word from the fast state.
//! 4. Classify the candidate against each occupied slot of the target
//!    shadow cell: same thread, byte intersection, write involvement,
//!    and finally the vector-clock ordering check. Only an intersecting,
//!    write-involved access by another thread whose epoch the current
//!    thread's clock has not yet covered is a race.
//! 5. Install the candidate: into the covered slot it absorbed, an empty
//!    slot, or a pseudo-randomly evicted one. Eviction keeps a
//!    representative spread of recent accesses; losing a slot only
//!    lowers detection probability, never soundness.
//!
//! Range accesses decompose into an unaligned head, an aligned
//! cell-sized middle and an unaligned tail, all under a single epoch
//! advance and trace record.

use std::sync::atomic::Ordering;

use rand::Rng;
use tracing::trace;

use crate::engine::Engine;
use crate::params::{SHADOW_CELL, SHADOW_CNT, SHADOW_STACK_MAX};
use crate::report::{MemoryLocation, RaceReport, Report, ReportFrame, ReportMop, ReportStack};
use crate::shadow::Shadow;
use crate::state::{ThreadState, STACK_IGNORE_FLAG};
use crate::stats::Stat;
use crate::trace::EventType;

impl Engine {
    /// Handle one sized access. `size_log` of 0..=3 encodes sizes
    /// 1, 2, 4, 8; `addr` must be aligned to the access size.
    pub(crate) fn memory_access(
        &self,
        thr: &mut ThreadState,
        pc: u64,
        addr: u64,
        size_log: u8,
        is_write: bool,
    ) {
        debug_assert!(size_log <= 3);
        debug_assert_eq!(addr & ((1 << size_log) - 1), 0, "misaligned sized access");
        if thr.fast_state.ignore_bit() {
            return;
        }
        if self.global_ignore.load(Ordering::Relaxed) {
            return;
        }
        if is_write {
            if thr.ignore_writes > 0 {
                return;
            }
        } else if thr.ignore_reads > 0 {
            return;
        }

        thr.stats.inc(Stat::Mop);
        thr.stats
            .inc(if is_write { Stat::MopWrite } else { Stat::MopRead });
        thr.stats.inc_mop_size(size_log);

        thr.increment_epoch(EventType::Mop, pc);
        let mut cur = Shadow::new(thr.fast_state);
        cur.set_write(is_write);
        cur.set_addr0_and_size_log(addr & (SHADOW_CELL - 1), size_log);
        trace!(tid = thr.tid, pc, addr, size_log, is_write, "memory access");

        self.memory_access_impl(thr, addr, cur, pc);
    }

    /// Classify `cur` against the shadow cell of `addr` and install it.
    fn memory_access_impl(&self, thr: &mut ThreadState, addr: u64, cur: Shadow, pc: u64) {
        let cell = self.shadow.cell(addr);
        let mut empty_idx = None;
        let mut absorbed = false;
        let mut race: Option<Shadow> = None;

        for (idx, slot) in cell.iter().enumerate() {
            thr.stats.inc(Stat::ShadowProcessed);
            let raw = slot.load(Ordering::Relaxed);
            if raw == 0 {
                thr.stats.inc(Stat::ShadowZero);
                if empty_idx.is_none() {
                    empty_idx = Some(idx);
                }
                continue;
            }
            let old = Shadow::from_raw(raw);
            if old.size_log() == cur.size_log() && old.addr0() == cur.addr0() {
                thr.stats.inc(Stat::ShadowSameSize);
            }
            if !old.intersects(&cur) {
                thr.stats.inc(Stat::ShadowNotIntersect);
                continue;
            }
            thr.stats.inc(Stat::ShadowIntersect);

            let replaces = cur.covers(&old) && (cur.is_write() || !old.is_write());

            if old.same_thread(&cur) {
                thr.stats.inc(Stat::ShadowSameThread);
                if old.clk() == cur.clk() {
                    thr.stats.inc(Stat::MopSame);
                }
                if replaces {
                    slot.store(cur.raw(), Ordering::Release);
                    absorbed = true;
                }
                continue;
            }
            thr.stats.inc(Stat::ShadowAnotherThread);

            if thr.clock.get(old.tid()) >= old.clk() {
                // The old access happens-before this one.
                if replaces {
                    slot.store(cur.raw(), Ordering::Release);
                    absorbed = true;
                }
                continue;
            }
            if !old.is_write() && !cur.is_write() {
                // Unordered reads do not conflict; keep both on record.
                continue;
            }
            if race.is_none() {
                race = Some(old);
            }
        }

        if !absorbed {
            let idx = match empty_idx {
                Some(idx) => idx,
                None => {
                    thr.stats.inc(Stat::ShadowReplace);
                    thr.rng.gen_range(0..SHADOW_CNT)
                }
            };
            cell[idx].store(cur.raw(), Ordering::Release);
        }

        if let Some(old) = race {
            self.report_race(thr, addr, cur, old, pc);
        }
    }

    /// Handle an arbitrary byte range under one epoch advance: unaligned
    /// head byte-by-byte, aligned middle cell-by-cell, unaligned tail
    /// byte-by-byte.
    pub(crate) fn memory_access_range(
        &self,
        thr: &mut ThreadState,
        pc: u64,
        addr: u64,
        size: u64,
        is_write: bool,
    ) {
        if size == 0 {
            return;
        }
        if thr.fast_state.ignore_bit() {
            return;
        }
        if self.global_ignore.load(Ordering::Relaxed) {
            return;
        }
        if is_write {
            if thr.ignore_writes > 0 {
                return;
            }
        } else if thr.ignore_reads > 0 {
            return;
        }

        thr.stats.inc(Stat::MopRange);
        thr.increment_epoch(EventType::Mop, pc);
        let fs = thr.fast_state;
        let make = |addr0: u64, size_log: u8| {
            let mut cur = Shadow::new(fs);
            cur.set_write(is_write);
            cur.set_addr0_and_size_log(addr0, size_log);
            cur
        };

        let mut addr = addr;
        let mut size = size;
        while addr % SHADOW_CELL != 0 && size > 0 {
            self.memory_access_impl(thr, addr, make(addr & (SHADOW_CELL - 1), 0), pc);
            addr += 1;
            size -= 1;
        }
        while size >= SHADOW_CELL {
            self.memory_access_impl(thr, addr, make(0, 3), pc);
            addr += SHADOW_CELL;
            size -= SHADOW_CELL;
        }
        while size > 0 {
            self.memory_access_impl(thr, addr, make(addr & (SHADOW_CELL - 1), 0), pc);
            addr += 1;
            size -= 1;
        }
    }

    pub(crate) fn func_enter(&self, thr: &mut ThreadState, pc: u64) {
        thr.stats.inc(Stat::FuncEnter);
        thr.increment_epoch(EventType::FuncEnter, pc);
        let mut entry = pc;
        if self.pc_recursive_ignored(pc) {
            entry |= STACK_IGNORE_FLAG;
            thr.ignore_reads += 1;
            thr.ignore_writes += 1;
            thr.update_ignore_bit();
        }
        if thr.shadow_stack.len() < SHADOW_STACK_MAX {
            thr.shadow_stack.push(entry);
        } else {
            thr.dropped_frames += 1;
        }
    }

    pub(crate) fn func_exit(&self, thr: &mut ThreadState) {
        thr.stats.inc(Stat::FuncExit);
        thr.increment_epoch(EventType::FuncExit, 0);
        if thr.dropped_frames > 0 {
            thr.dropped_frames -= 1;
            return;
        }
        match thr.shadow_stack.pop() {
            Some(entry) => {
                if entry & STACK_IGNORE_FLAG != 0 {
                    thr.ignore_reads = thr.ignore_reads.saturating_sub(1);
                    thr.ignore_writes = thr.ignore_writes.saturating_sub(1);
                    thr.update_ignore_bit();
                }
            }
            None => tracing::warn!(tid = thr.tid, "function exit with an empty call stack"),
        }
    }

    /// Build, filter and emit a race report for `cur` against `old`.
    fn report_race(&self, thr: &mut ThreadState, addr: u64, cur: Shadow, old: Shadow, pc: u64) {
        if self
            .benign_ranges
            .lock()
            .unwrap()
            .iter()
            .any(|&(base, size)| addr >= base && addr < base + size)
        {
            thr.stats.inc(Stat::RacesSuppressed);
            return;
        }

        // Reconstruct the old access from its thread's trace. The slot
        // may have been reused since; the trace validity check rejects
        // epochs from a previous incarnation.
        let old_trace = {
            let reg = self.registry.lock().unwrap();
            reg.get(old.tid()).and_then(|tctx| tctx.trace.clone())
        };
        let old_stack = old_trace.and_then(|t| t.lock().unwrap().restore_stack(old.clk()));
        let old_pc = old_stack
            .as_ref()
            .and_then(|pcs| pcs.last().copied())
            .unwrap_or(0);

        let cell_addr = addr & !(SHADOW_CELL - 1);
        let key = (pc.min(old_pc), pc.max(old_pc), cell_addr);
        if self.dedup.lock().unwrap().check_and_record(key) {
            thr.stats.inc(Stat::RacesSuppressed);
            return;
        }

        if !self.ignores.is_empty() {
            let frame = self.symbolizer.symbolize(pc);
            if self.ignores.is_ignored(&frame) {
                thr.stats.inc(Stat::RacesSuppressed);
                return;
            }
            if old_pc != 0 {
                let frame = self.symbolizer.symbolize(old_pc);
                if self.ignores.is_ignored(&frame) {
                    thr.stats.inc(Stat::RacesSuppressed);
                    return;
                }
            }
        }

        let mops = vec![
            ReportMop {
                tid: cur.tid(),
                write: cur.is_write(),
                size: cur.size(),
                addr: cell_addr + cur.addr0(),
                stack: Some(self.symbolize_stack(&thr.stack_with(pc))),
            },
            ReportMop {
                tid: old.tid(),
                write: old.is_write(),
                size: old.size(),
                addr: cell_addr + old.addr0(),
                stack: old_stack.map(|pcs| self.symbolize_stack(&pcs)),
            },
        ];
        let location = self.classify_location(thr, addr);
        thr.stats.inc(Stat::Races);
        self.emit_report(Report::Race(RaceReport { mops, location }));
    }

    /// Symbolize an outermost-first pc list into an innermost-first
    /// report stack, dropping history-ignored frames.
    pub(crate) fn symbolize_stack(&self, pcs: &[u64]) -> ReportStack {
        let frames = pcs
            .iter()
            .rev()
            .map(|&pc| self.symbolizer.symbolize(pc))
            .filter(|frame| !self.ignores.is_history_ignored(frame))
            .map(|frame| ReportFrame {
                pc: frame.pc,
                function: frame.function,
                object: frame.object,
                file: frame.file,
                line: frame.line,
            })
            .collect();
        ReportStack { frames }
    }

    /// What memory does `addr` belong to, as far as the engine knows?
    fn classify_location(&self, thr: &ThreadState, addr: u64) -> MemoryLocation {
        if let Some(global) = self
            .globals
            .lock()
            .unwrap()
            .iter()
            .find(|g| addr >= g.addr && addr < g.addr + g.size)
        {
            return MemoryLocation::Global {
                name: global.name.clone(),
                addr: global.addr,
                size: global.size,
            };
        }
        {
            let allocations = self.allocations.lock().unwrap();
            if let Some((&base, info)) = allocations.range(..=addr).next_back() {
                if addr < base + info.size {
                    return MemoryLocation::Heap {
                        addr: base,
                        size: info.size,
                        alloc_tid: info.tid,
                        alloc_stack: self.symbolize_stack(&info.stack),
                    };
                }
            }
        }
        if thr.stk_size > 0 && addr >= thr.stk_addr && addr < thr.stk_addr + thr.stk_size {
            return MemoryLocation::Stack { tid: thr.tid };
        }
        MemoryLocation::Unknown
    }
}
