//! The process-wide engine context and the per-thread event handle.
//!
//! An [`Engine`] owns everything shared: the shadow region, the
//! synchronization-variable table, the thread registry, the report
//! machinery and the configuration. Each traced thread registers itself
//! and receives a [`ThreadHandle`], the front door through which the
//! instrumentation layer feeds memory accesses, function entry/exit,
//! synchronization operations and lifecycle events.
//!
//! A handle owns its thread's mutable state, so events for one thread
//! are inherently serialized; cross-thread coordination happens only
//! through the shared structures, each behind its own lock or atomic.
//!
//! ```no_run
//! use std::sync::Arc;
//! use centinela::{Engine, Flags};
//!
//! let engine = Arc::new(Engine::new(Flags::default()).unwrap());
//! let mut main = engine.start_main_thread();
//!
//! let child_uid = 1;
//! let tid = main.thread_create(0x1000, child_uid, false);
//! let engine2 = Arc::clone(&engine);
//! let worker = std::thread::spawn(move || {
//!     let mut thr = engine2.thread_start(tid, (0, 0), (0, 0));
//!     thr.memory_write(0x2000, 0x10_0000, 2);
//!     thr.finish();
//! });
//! worker.join().unwrap();
//! main.thread_join(0x1004, child_uid);
//!
//! let exit_code = engine.finalize(main);
//! assert_eq!(exit_code, 0);
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use tracing::{debug, warn};

use crate::flags::Flags;
use crate::ignore::IgnoreSet;
use crate::params::{Tid, CLK_MASK};
use crate::registry::{Registry, ThreadStatus};
use crate::report::{DedupWindow, Report, ReportSink, ThreadLeakReport};
use crate::shadow_mem::ShadowMem;
use crate::state::ThreadState;
use crate::stats::{Stat, StatSet};
use crate::symbolize::{AddrSymbolizer, Symbolizer};
use crate::sync::SyncTab;
use crate::trace::{EventType, Trace};

/// Heap allocation tracked for report locations.
pub(crate) struct AllocInfo {
    pub size: u64,
    pub tid: Tid,
    pub stack: Vec<u64>,
}

/// Registered global variable, for report locations.
pub(crate) struct GlobalVar {
    pub name: String,
    pub addr: u64,
    pub size: u64,
}

/// Process-wide race-detection context.
pub struct Engine {
    pub(crate) flags: Flags,
    pub(crate) shadow: ShadowMem,
    pub(crate) sync_tab: SyncTab,
    pub(crate) registry: Mutex<Registry>,
    pub(crate) dedup: Mutex<DedupWindow>,
    pub(crate) sink: ReportSink,
    pub(crate) allocations: Mutex<BTreeMap<u64, AllocInfo>>,
    pub(crate) globals: Mutex<Vec<GlobalVar>>,
    pub(crate) benign_ranges: Mutex<Vec<(u64, u64)>>,
    pub(crate) global_ignore: AtomicBool,
    pub(crate) ignores: IgnoreSet,
    pub(crate) symbolizer: Box<dyn Symbolizer>,
    pub(crate) nreported: AtomicU64,
    pub(crate) stats: Mutex<StatSet>,
    /// pc → (instrument?, recursive-ignore?) decisions, cached because
    /// symbolization is expensive and pcs repeat.
    pub(crate) pc_cache: Mutex<HashMap<u64, (bool, bool)>>,
}

impl Engine {
    /// Build an engine, reserving the shadow region.
    pub fn new(flags: Flags) -> Result<Engine> {
        let shadow = ShadowMem::new()?;
        let sink = ReportSink::new(flags.report_sink_capacity);
        let dedup = Mutex::new(DedupWindow::new(flags.report_dedup_window));
        Ok(Engine {
            flags,
            shadow,
            sync_tab: SyncTab::new(),
            registry: Mutex::new(Registry::new()),
            dedup,
            sink,
            allocations: Mutex::new(BTreeMap::new()),
            globals: Mutex::new(Vec::new()),
            benign_ranges: Mutex::new(Vec::new()),
            global_ignore: AtomicBool::new(false),
            ignores: IgnoreSet::default(),
            symbolizer: Box::new(AddrSymbolizer),
            nreported: AtomicU64::new(0),
            stats: Mutex::new(StatSet::new()),
            pc_cache: Mutex::new(HashMap::new()),
        })
    }

    /// Install an ignore list. Call before any thread starts.
    pub fn with_ignores(mut self, ignores: IgnoreSet) -> Engine {
        self.ignores = ignores;
        self
    }

    /// Install a symbolizer. Call before any thread starts.
    pub fn with_symbolizer(mut self, symbolizer: Box<dyn Symbolizer>) -> Engine {
        self.symbolizer = symbolizer;
        self
    }

    /// Register the initial thread (slot 0) and hand back its handle.
    pub fn start_main_thread(self: &Arc<Self>) -> ThreadHandle {
        let tid = {
            let mut reg = self.registry.lock().unwrap();
            reg.create(self.flags.thread_quarantine_size, 0, false, Vec::new())
        };
        assert_eq!(tid, 0, "the initial thread must take slot 0");
        self.thread_start(tid, (0, 0), (0, 0))
    }

    /// Register a new thread slot on behalf of `thr` and publish the
    /// parent's clock to it. Returns the slot id the host should pass to
    /// [`Engine::thread_start`] on the new OS thread.
    pub(crate) fn thread_create(
        &self,
        thr: &mut ThreadState,
        pc: u64,
        uid: u64,
        detached: bool,
    ) -> Tid {
        let creation_stack = thr.stack_with(pc);
        let mut reg = self.registry.lock().unwrap();
        let tid = reg.create(
            self.flags.thread_quarantine_size,
            uid,
            detached,
            creation_stack,
        );
        thr.stats.inc(Stat::ThreadsCreated);
        if reg.get(tid).unwrap().reuse_count > 0 {
            thr.stats.inc(Stat::ThreadsReused);
        }

        // Parent half of the create/start happens-before edge.
        thr.increment_epoch(EventType::Mop, 0);
        let clk = thr.fast_state.epoch();
        thr.clock.set(thr.tid, clk);
        thr.fast_synch_epoch = clk;
        let tctx = reg.get_mut(tid).unwrap();
        thr.clock.release(&mut tctx.sync);
        debug!(parent = thr.tid, tid, uid, detached, "thread create");
        tid
    }

    /// Start a created thread slot. Runs on the new thread; resets the
    /// shadow of its stack and TLS ranges and completes the create/start
    /// happens-before edge.
    pub fn thread_start(self: &Arc<Self>, tid: Tid, stk: (u64, u64), tls: (u64, u64)) -> ThreadHandle {
        self.shadow.reset_range(stk.0, stk.1);
        self.shadow.reset_range(tls.0, tls.1);

        let mut reg = self.registry.lock().unwrap();
        let tctx = reg.get_mut(tid).expect("starting an unknown thread slot");
        assert_eq!(
            tctx.status,
            ThreadStatus::Created,
            "starting a thread slot that is not in the created state"
        );
        tctx.status = ThreadStatus::Running;
        assert!(tctx.epoch1 < CLK_MASK, "epoch space exhausted for slot");
        tctx.epoch0 = tctx.epoch1 + 1;
        let trace = Arc::new(Mutex::new(Trace::new()));
        tctx.trace = Some(Arc::clone(&trace));

        let mut thr = ThreadState::new(tid, tctx.epoch0, trace, stk, tls);
        thr.clock.set(tid, tctx.epoch0);
        thr.clock.acquire(&tctx.sync);
        debug!(tid, epoch0 = tctx.epoch0, "thread start");
        drop(reg);

        ThreadHandle {
            engine: Arc::clone(self),
            thr,
        }
    }

    pub(crate) fn thread_finish(&self, thr: &mut ThreadState) {
        self.shadow.reset_range(thr.stk_addr, thr.stk_size);
        self.shadow.reset_range(thr.tls_addr, thr.tls_size);

        let mut reg = self.registry.lock().unwrap();
        let tid = thr.tid;
        let detached = {
            let tctx = reg.get(tid).expect("finishing an unknown thread slot");
            assert_eq!(
                tctx.status,
                ThreadStatus::Running,
                "finishing a thread slot that is not running"
            );
            tctx.detached
        };
        if detached {
            reg.get_mut(tid).unwrap().epoch1 = thr.fast_state.epoch();
            reg.mark_dead(tid);
        } else {
            // Child half of the finish/join happens-before edge.
            thr.increment_epoch(EventType::Mop, 0);
            let clk = thr.fast_state.epoch();
            thr.clock.set(tid, clk);
            thr.fast_synch_epoch = clk;
            let tctx = reg.get_mut(tid).unwrap();
            tctx.epoch1 = clk;
            thr.clock.release(&mut tctx.sync);
            tctx.status = ThreadStatus::Finished;
        }
        drop(reg);
        debug!(tid, "thread finish");

        if self.flags.collect_stats {
            self.stats.lock().unwrap().merge(&thr.stats);
        }
    }

    pub(crate) fn thread_join(&self, thr: &mut ThreadState, pc: u64, uid: u64) {
        let _ = pc;
        let mut reg = self.registry.lock().unwrap();
        let Some(tid) = reg.find_by_uid(uid) else {
            warn!(uid, "join of a non-existent thread");
            return;
        };
        let tctx = reg.get(tid).unwrap();
        if tctx.detached {
            warn!(uid, tid, "join of a detached thread");
            return;
        }
        if tctx.status != ThreadStatus::Finished {
            warn!(uid, tid, status = ?tctx.status, "join of a thread that has not finished");
            return;
        }
        thr.clock.acquire(&tctx.sync);
        reg.mark_dead(tid);
        debug!(joiner = thr.tid, tid, uid, "thread join");
    }

    pub(crate) fn thread_detach(&self, thr: &mut ThreadState, pc: u64, uid: u64) {
        let _ = (pc, thr.tid);
        let mut reg = self.registry.lock().unwrap();
        let Some(tid) = reg.find_by_uid(uid) else {
            warn!(uid, "detach of a non-existent thread");
            return;
        };
        if reg.get(tid).unwrap().status == ThreadStatus::Finished {
            reg.mark_dead(tid);
        } else {
            reg.get_mut(tid).unwrap().detached = true;
        }
        debug!(tid, uid, "thread detach");
    }

    /// Process-exit hook: report leaked threads, fold in the initial
    /// thread's statistics, and return the exit-code override: the
    /// configured `error_exitcode` if anything was reported, else zero,
    /// meaning the host's own exit code stands.
    pub fn finalize(&self, main: ThreadHandle) -> i32 {
        let ThreadHandle { thr, .. } = main;
        if self.flags.report_thread_leaks {
            let leaks: Vec<ThreadLeakReport> = {
                let reg = self.registry.lock().unwrap();
                reg.iter()
                    .filter(|tctx| tctx.tid != thr.tid && !tctx.detached)
                    .filter(|tctx| {
                        matches!(
                            tctx.status,
                            ThreadStatus::Created | ThreadStatus::Running | ThreadStatus::Finished
                        )
                    })
                    .map(|tctx| ThreadLeakReport {
                        tid: tctx.tid,
                        running: tctx.status != ThreadStatus::Finished,
                        creation_stack: self.symbolize_stack(&tctx.creation_stack),
                    })
                    .collect()
            };
            for leak in leaks {
                warn!(tid = leak.tid, running = leak.running, "thread leak");
                self.emit_report(Report::ThreadLeak(leak));
            }
        }
        if self.flags.collect_stats {
            self.stats.lock().unwrap().merge(&thr.stats);
        }
        if self.flags.print_stats {
            eprintln!("{}", self.stats.lock().unwrap().summary());
        }
        if self.nreported.load(Ordering::Relaxed) > 0 {
            self.flags.error_exitcode
        } else {
            0
        }
    }

    /// Count a report, render it if configured, and queue it on the sink.
    pub(crate) fn emit_report(&self, report: Report) {
        self.nreported.fetch_add(1, Ordering::Relaxed);
        if self.flags.print_reports {
            match &report {
                Report::Race(r) => eprintln!("{}", r.render()),
                Report::ThreadLeak(r) => eprintln!("{}", r.render()),
            }
        }
        self.sink.push(report);
    }

    /// Reports emitted so far (races and leaks, including any the sink
    /// had to drop).
    pub fn reports_emitted(&self) -> u64 {
        self.nreported.load(Ordering::Relaxed)
    }

    /// Take all queued reports.
    pub fn drain_reports(&self) -> Vec<Report> {
        self.sink.drain()
    }

    /// Merged statistics of finished threads (plus the main thread once
    /// finalized).
    pub fn stats(&self) -> StatSet {
        self.stats.lock().unwrap().clone()
    }

    /// Suppress all race checking engine-wide until turned off again.
    pub fn global_ignore_on(&self) {
        self.global_ignore.store(true, Ordering::Relaxed);
    }

    pub fn global_ignore_off(&self) {
        self.global_ignore.store(false, Ordering::Relaxed);
    }

    /// Mark `[addr, addr + size)` as an expected-race region; accesses
    /// inside it never produce reports.
    pub fn annotate_benign_race(&self, addr: u64, size: u64) {
        self.benign_ranges.lock().unwrap().push((addr, size));
    }

    /// Register a global variable so racy accesses to it can name it.
    pub fn register_global(&self, name: &str, addr: u64, size: u64) {
        self.globals.lock().unwrap().push(GlobalVar {
            name: name.to_string(),
            addr,
            size,
        });
    }

    /// Should the front-end instrument code at `pc` at all? False when
    /// the pc's frame matches a plain or recursive ignore entry.
    pub fn should_instrument(&self, pc: u64) -> bool {
        if self.ignores.is_empty() {
            return true;
        }
        self.pc_decisions(pc).0
    }

    /// Does `pc` open a recursive-ignore scope?
    pub(crate) fn pc_recursive_ignored(&self, pc: u64) -> bool {
        if self.ignores.ignores_r.is_empty() {
            return false;
        }
        self.pc_decisions(pc).1
    }

    fn pc_decisions(&self, pc: u64) -> (bool, bool) {
        if let Some(&cached) = self.pc_cache.lock().unwrap().get(&pc) {
            return cached;
        }
        let frame = self.symbolizer.symbolize(pc);
        let recursive = self.ignores.is_recursive_ignored(&frame);
        let instrument = !recursive && !self.ignores.is_ignored(&frame);
        let decisions = (instrument, recursive);
        self.pc_cache.lock().unwrap().insert(pc, decisions);
        decisions
    }

    pub(crate) fn malloc(&self, thr: &mut ThreadState, pc: u64, addr: u64, size: u64) {
        debug!(tid = thr.tid, addr, size, "malloc");
        self.allocations.lock().unwrap().insert(
            addr,
            AllocInfo {
                size,
                tid: thr.tid,
                stack: thr.stack_with(pc),
            },
        );
        self.shadow.reset_range(addr, size);
        // Allocator-to-user publication edge.
        thr.increment_epoch(EventType::Unlock, pc);
        if thr.ignore_sync == 0 {
            let sv = self.sync_tab.get_or_create(addr, || thr.stack_with(pc));
            let mut st = sv.state.write().unwrap();
            self.release_clock(thr, &mut st);
        }
    }

    pub(crate) fn free(&self, thr: &mut ThreadState, pc: u64, addr: u64) {
        let _ = pc;
        let removed = self.allocations.lock().unwrap().remove(&addr);
        match removed {
            Some(info) => {
                debug!(tid = thr.tid, addr, size = info.size, "free");
                self.shadow.reset_range(addr, info.size);
                self.sync_tab.remove_range(addr, addr + info.size);
            }
            None => warn!(tid = thr.tid, addr, "free of untracked memory"),
        }
    }
}

/// Per-thread front door for instrumentation events.
///
/// The handle is `Send`: create it on the thread it describes (via
/// [`Engine::thread_start`]) and keep it there. Every event method opens
/// an engine scope (the `in_rtl` counter) so the engine's own work is
/// never fed back through the access handler.
pub struct ThreadHandle {
    pub(crate) engine: Arc<Engine>,
    pub(crate) thr: ThreadState,
}

impl ThreadHandle {
    pub fn tid(&self) -> Tid {
        self.thr.tid
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    fn scoped(&mut self, f: impl FnOnce(&Engine, &mut ThreadState)) {
        if self.thr.in_rtl > 0 {
            return;
        }
        self.thr.in_rtl += 1;
        f(&self.engine, &mut self.thr);
        self.thr.in_rtl -= 1;
    }

    /// Read of `1 << size_log` bytes at `addr` from the code at `pc`.
    pub fn memory_read(&mut self, pc: u64, addr: u64, size_log: u8) {
        self.scoped(|eng, thr| eng.memory_access(thr, pc, addr, size_log, false));
    }

    /// Write of `1 << size_log` bytes at `addr` from the code at `pc`.
    pub fn memory_write(&mut self, pc: u64, addr: u64, size_log: u8) {
        self.scoped(|eng, thr| eng.memory_access(thr, pc, addr, size_log, true));
    }

    /// Access of an arbitrary byte range, e.g. from memcpy-like code.
    pub fn memory_access_range(&mut self, pc: u64, addr: u64, size: u64, is_write: bool) {
        self.scoped(|eng, thr| eng.memory_access_range(thr, pc, addr, size, is_write));
    }

    pub fn func_enter(&mut self, pc: u64) {
        self.scoped(|eng, thr| eng.func_enter(thr, pc));
    }

    pub fn func_exit(&mut self) {
        self.scoped(|eng, thr| eng.func_exit(thr));
    }

    pub fn mutex_create(&mut self, pc: u64, addr: u64, is_rw: bool, is_recursive: bool) {
        self.scoped(|eng, thr| eng.mutex_create(thr, pc, addr, is_rw, is_recursive));
    }

    pub fn mutex_destroy(&mut self, pc: u64, addr: u64) {
        self.scoped(|eng, thr| eng.mutex_destroy(thr, pc, addr));
    }

    /// `write` selects the exclusive side of a read/write mutex; plain
    /// mutexes always lock with `write = true`.
    pub fn mutex_lock(&mut self, pc: u64, addr: u64, write: bool) {
        self.scoped(|eng, thr| eng.mutex_lock(thr, pc, addr, write));
    }

    pub fn mutex_unlock(&mut self, pc: u64, addr: u64, write: bool) {
        self.scoped(|eng, thr| eng.mutex_unlock(thr, pc, addr, write));
    }

    pub fn cond_signal(&mut self, pc: u64, addr: u64) {
        self.scoped(|eng, thr| eng.cond_signal(thr, pc, addr));
    }

    /// Entering a condition wait: releases `mtx` on the waiter's behalf.
    /// The wake-up relock is delivered as an ordinary [`Self::mutex_lock`].
    pub fn cond_wait_before(&mut self, pc: u64, cond: u64, mtx: u64) {
        self.scoped(|eng, thr| eng.cond_wait_before(thr, pc, cond, mtx));
    }

    pub fn cond_wait_after(&mut self, pc: u64, cond: u64) {
        self.scoped(|eng, thr| eng.cond_wait_after(thr, pc, cond));
    }

    pub fn sem_post(&mut self, pc: u64, addr: u64) {
        self.scoped(|eng, thr| eng.sem_post(thr, pc, addr));
    }

    pub fn sem_wait(&mut self, pc: u64, addr: u64) {
        self.scoped(|eng, thr| eng.sem_wait(thr, pc, addr));
    }

    pub fn barrier_init(&mut self, pc: u64, addr: u64, count: u32) {
        self.scoped(|eng, thr| eng.barrier_init(thr, pc, addr, count));
    }

    pub fn barrier_wait_before(&mut self, pc: u64, addr: u64) {
        self.scoped(|eng, thr| eng.barrier_wait_before(thr, pc, addr));
    }

    pub fn barrier_wait_after(&mut self, pc: u64, addr: u64) {
        self.scoped(|eng, thr| eng.barrier_wait_after(thr, pc, addr));
    }

    /// A fresh allocation: publication edge plus shadow reset.
    pub fn malloc(&mut self, pc: u64, addr: u64, size: u64) {
        self.scoped(|eng, thr| eng.malloc(thr, pc, addr, size));
    }

    pub fn free(&mut self, pc: u64, addr: u64) {
        self.scoped(|eng, thr| eng.free(thr, pc, addr));
    }

    pub fn ignore_reads_begin(&mut self) {
        self.thr.ignore_reads += 1;
        self.thr.update_ignore_bit();
    }

    pub fn ignore_reads_end(&mut self) {
        if self.thr.ignore_reads == 0 {
            warn!(tid = self.thr.tid, "unbalanced read-ignore scope");
            return;
        }
        self.thr.ignore_reads -= 1;
        self.thr.update_ignore_bit();
    }

    pub fn ignore_writes_begin(&mut self) {
        self.thr.ignore_writes += 1;
        self.thr.update_ignore_bit();
    }

    pub fn ignore_writes_end(&mut self) {
        if self.thr.ignore_writes == 0 {
            warn!(tid = self.thr.tid, "unbalanced write-ignore scope");
            return;
        }
        self.thr.ignore_writes -= 1;
        self.thr.update_ignore_bit();
    }

    pub fn ignore_sync_begin(&mut self) {
        self.thr.ignore_sync += 1;
    }

    pub fn ignore_sync_end(&mut self) {
        if self.thr.ignore_sync == 0 {
            warn!(tid = self.thr.tid, "unbalanced sync-ignore scope");
            return;
        }
        self.thr.ignore_sync -= 1;
    }

    /// Register a thread the host is about to spawn. Returns the slot id
    /// to pass to [`Engine::thread_start`] on the new thread.
    pub fn thread_create(&mut self, pc: u64, uid: u64, detached: bool) -> Tid {
        self.thr.in_rtl += 1;
        let tid = self.engine.thread_create(&mut self.thr, pc, uid, detached);
        self.thr.in_rtl -= 1;
        tid
    }

    pub fn thread_join(&mut self, pc: u64, uid: u64) {
        self.scoped(|eng, thr| eng.thread_join(thr, pc, uid));
    }

    pub fn thread_detach(&mut self, pc: u64, uid: u64) {
        self.scoped(|eng, thr| eng.thread_detach(thr, pc, uid));
    }

    /// Tear down this thread's engine state. The slot moves to
    /// `Finished` (or straight to `Dead` when detached) and its trace is
    /// retained for post-mortem reports.
    pub fn finish(mut self) {
        self.thr.in_rtl += 1;
        let engine = Arc::clone(&self.engine);
        engine.thread_finish(&mut self.thr);
    }
}
