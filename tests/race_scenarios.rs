//! End-to-end race detection scenarios.
//!
//! Each test drives a fresh engine through a fixed interleaving of
//! instrumentation events. Thread handles are plain state machines, so
//! an interleaving can be replayed deterministically from a single test
//! thread; `concurrent_smoke.rs` covers the genuinely parallel case.

use std::sync::Arc;

use centinela::{Engine, Flags, MemoryLocation, Report};

fn engine() -> Arc<Engine> {
    Arc::new(Engine::new(Flags::default()).unwrap())
}

fn race_reports(engine: &Engine) -> Vec<centinela::RaceReport> {
    engine
        .drain_reports()
        .into_iter()
        .filter_map(|r| match r {
            Report::Race(r) => Some(r),
            Report::ThreadLeak(_) => None,
        })
        .collect()
}

const X: u64 = 0x10_0000;

#[test]
fn unsynchronized_writes_race() {
    let engine = engine();
    let mut main = engine.start_main_thread();
    let t1 = main.thread_create(0x10, 1, false);
    let t2 = main.thread_create(0x14, 2, false);

    let mut h1 = engine.thread_start(t1, (0, 0), (0, 0));
    let mut h2 = engine.thread_start(t2, (0, 0), (0, 0));

    h1.memory_write(0x100, X, 2);
    h2.memory_write(0x200, X, 2);

    let reports = race_reports(&engine);
    assert_eq!(reports.len(), 1);
    let rep = &reports[0];
    assert_eq!(rep.mops.len(), 2);
    assert!(rep.mops.iter().all(|m| m.write));
    assert!(rep.mops.iter().all(|m| m.addr == X));
    assert_eq!(rep.mops[0].tid, t2);
    assert_eq!(rep.mops[1].tid, t1);
    assert_eq!(rep.mops[0].size, 4);

    h1.finish();
    h2.finish();
    main.thread_join(0x18, 1);
    main.thread_join(0x1c, 2);
    assert_eq!(engine.finalize(main), 66);
}

#[test]
fn lock_ordered_writes_do_not_race() {
    let engine = engine();
    let mut main = engine.start_main_thread();
    let t1 = main.thread_create(0x10, 1, false);
    let t2 = main.thread_create(0x14, 2, false);
    let m = 0x20_0000;

    let mut h1 = engine.thread_start(t1, (0, 0), (0, 0));
    let mut h2 = engine.thread_start(t2, (0, 0), (0, 0));

    h1.mutex_lock(0x100, m, true);
    h1.memory_write(0x104, X, 2);
    h1.mutex_unlock(0x108, m, true);

    h2.mutex_lock(0x200, m, true);
    h2.memory_write(0x204, X, 2);
    h2.mutex_unlock(0x208, m, true);

    assert!(race_reports(&engine).is_empty());

    h1.finish();
    h2.finish();
    main.thread_join(0x18, 1);
    main.thread_join(0x1c, 2);
    assert_eq!(engine.finalize(main), 0);
}

#[test]
fn write_before_create_is_ordered() {
    let engine = engine();
    let mut main = engine.start_main_thread();

    main.memory_write(0x100, X, 2);
    let t1 = main.thread_create(0x104, 1, false);
    let mut h1 = engine.thread_start(t1, (0, 0), (0, 0));
    h1.memory_read(0x200, X, 2);

    assert!(race_reports(&engine).is_empty());
}

#[test]
fn write_after_create_races_with_child_read() {
    let engine = engine();
    let mut main = engine.start_main_thread();

    let t1 = main.thread_create(0x104, 1, false);
    main.memory_write(0x100, X, 2);
    let mut h1 = engine.thread_start(t1, (0, 0), (0, 0));
    h1.memory_read(0x200, X, 2);

    let reports = race_reports(&engine);
    assert_eq!(reports.len(), 1);
    let rep = &reports[0];
    assert!(!rep.mops[0].write);
    assert_eq!(rep.mops[0].tid, t1);
    assert!(rep.mops[1].write);
    assert_eq!(rep.mops[1].tid, 0);
}

#[test]
fn concurrent_reads_do_not_race() {
    let engine = engine();
    let mut main = engine.start_main_thread();
    let t1 = main.thread_create(0x10, 1, false);
    let t2 = main.thread_create(0x14, 2, false);

    let mut h1 = engine.thread_start(t1, (0, 0), (0, 0));
    let mut h2 = engine.thread_start(t2, (0, 0), (0, 0));

    h1.memory_read(0x100, X, 2);
    h2.memory_read(0x200, X, 2);
    h1.memory_read(0x108, X, 2);

    assert!(race_reports(&engine).is_empty());
}

#[test]
fn read_write_conflict_races() {
    let engine = engine();
    let mut main = engine.start_main_thread();
    let t1 = main.thread_create(0x10, 1, false);
    let t2 = main.thread_create(0x14, 2, false);

    let mut h1 = engine.thread_start(t1, (0, 0), (0, 0));
    let mut h2 = engine.thread_start(t2, (0, 0), (0, 0));

    h1.memory_read(0x100, X, 3);
    h2.memory_write(0x200, X, 3);

    let reports = race_reports(&engine);
    assert_eq!(reports.len(), 1);
    assert!(reports[0].mops[0].write);
    assert!(!reports[0].mops[1].write);
}

#[test]
fn accesses_by_one_thread_never_race() {
    let engine = engine();
    let mut main = engine.start_main_thread();
    for i in 0..200u64 {
        main.memory_write(0x100 + i, X, 2);
        main.memory_read(0x500 + i, X, 2);
        main.memory_write(0x900 + i, X + 4, 0);
    }
    assert!(race_reports(&engine).is_empty());
    assert_eq!(engine.finalize(main), 0);
}

#[test]
fn disjoint_bytes_of_one_cell_do_not_race() {
    let engine = engine();
    let mut main = engine.start_main_thread();
    let t1 = main.thread_create(0x10, 1, false);
    let t2 = main.thread_create(0x14, 2, false);

    let mut h1 = engine.thread_start(t1, (0, 0), (0, 0));
    let mut h2 = engine.thread_start(t2, (0, 0), (0, 0));

    // Same shadow cell, non-overlapping halves.
    h1.memory_write(0x100, X, 2);
    h2.memory_write(0x200, X + 4, 2);

    assert!(race_reports(&engine).is_empty());
}

#[test]
fn duplicate_races_are_reported_once() {
    let engine = engine();
    let mut main = engine.start_main_thread();
    let t1 = main.thread_create(0x10, 1, false);
    let t2 = main.thread_create(0x14, 2, false);

    let mut h1 = engine.thread_start(t1, (0, 0), (0, 0));
    let mut h2 = engine.thread_start(t2, (0, 0), (0, 0));

    h1.memory_write(0x100, X, 2);
    for _ in 0..10 {
        h2.memory_write(0x200, X, 2);
        h1.memory_write(0x100, X, 2);
    }

    assert_eq!(race_reports(&engine).len(), 1);
}

#[test]
fn heap_race_names_the_allocation() {
    let engine = engine();
    let mut main = engine.start_main_thread();
    let heap = 0x30_0000;
    main.func_enter(0xaa00);
    main.malloc(0xaa04, heap, 64);
    main.func_exit();

    let t1 = main.thread_create(0x10, 1, false);
    let t2 = main.thread_create(0x14, 2, false);
    let mut h1 = engine.thread_start(t1, (0, 0), (0, 0));
    let mut h2 = engine.thread_start(t2, (0, 0), (0, 0));

    h1.memory_write(0x100, heap + 8, 3);
    h2.memory_write(0x200, heap + 8, 3);

    let reports = race_reports(&engine);
    assert_eq!(reports.len(), 1);
    match &reports[0].location {
        MemoryLocation::Heap {
            addr,
            size,
            alloc_tid,
            alloc_stack,
        } => {
            assert_eq!(*addr, heap);
            assert_eq!(*size, 64);
            assert_eq!(*alloc_tid, 0);
            let pcs: Vec<u64> = alloc_stack.frames.iter().map(|f| f.pc).collect();
            assert_eq!(pcs, vec![0xaa04, 0xaa00]);
        }
        other => panic!("expected a heap location, got {other:?}"),
    }
}

#[test]
fn global_race_names_the_symbol() {
    let engine = engine();
    engine.register_global("g_counter", X, 8);
    let mut main = engine.start_main_thread();
    let t1 = main.thread_create(0x10, 1, false);
    let t2 = main.thread_create(0x14, 2, false);
    let mut h1 = engine.thread_start(t1, (0, 0), (0, 0));
    let mut h2 = engine.thread_start(t2, (0, 0), (0, 0));

    h1.memory_write(0x100, X, 3);
    h2.memory_write(0x200, X, 3);

    let reports = race_reports(&engine);
    assert_eq!(reports.len(), 1);
    match &reports[0].location {
        MemoryLocation::Global { name, addr, size } => {
            assert_eq!(name, "g_counter");
            assert_eq!(*addr, X);
            assert_eq!(*size, 8);
        }
        other => panic!("expected a global location, got {other:?}"),
    }
    let text = reports[0].render();
    assert!(text.contains("WARNING: ThreadSanitizer: data race"));
    assert!(text.contains("Location is global g_counter of size 8"));
}

#[test]
fn report_stacks_carry_the_call_context() {
    let engine = engine();
    let mut main = engine.start_main_thread();
    let t1 = main.thread_create(0x10, 1, false);
    let t2 = main.thread_create(0x14, 2, false);

    let mut h1 = engine.thread_start(t1, (0, 0), (0, 0));
    let mut h2 = engine.thread_start(t2, (0, 0), (0, 0));

    h1.func_enter(0x1000);
    h1.func_enter(0x1100);
    h1.memory_write(0x1104, X, 2);
    h1.func_exit();
    h1.func_exit();

    h2.func_enter(0x2000);
    h2.memory_write(0x2004, X, 2);
    h2.func_exit();

    let reports = race_reports(&engine);
    assert_eq!(reports.len(), 1);
    let rep = &reports[0];

    // Current access: innermost frame first, straight off the live
    // shadow stack.
    let cur: Vec<u64> = rep.mops[0].stack.as_ref().unwrap().frames.iter().map(|f| f.pc).collect();
    assert_eq!(cur, vec![0x2004, 0x2000]);

    // Old access: rebuilt from the other thread's trace, after its
    // stack has already unwound.
    let old: Vec<u64> = rep.mops[1].stack.as_ref().unwrap().frames.iter().map(|f| f.pc).collect();
    assert_eq!(old, vec![0x1104, 0x1100, 0x1000]);
}

#[test]
fn race_report_renders_in_the_stable_layout() {
    let engine = engine();
    let mut main = engine.start_main_thread();
    let t1 = main.thread_create(0x10, 1, false);
    let t2 = main.thread_create(0x14, 2, false);
    let mut h1 = engine.thread_start(t1, (0, 0), (0, 0));
    let mut h2 = engine.thread_start(t2, (0, 0), (0, 0));

    h1.memory_write(0x100, X, 2);
    h2.memory_read(0x200, X, 2);

    let reports = race_reports(&engine);
    let text = reports[0].render();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines[0], "==================");
    assert_eq!(lines[1], "WARNING: ThreadSanitizer: data race");
    assert!(lines[2].starts_with("  Read of size 4 at 0x100000 by thread 2:"));
    assert!(text.contains("  Previous Write of size 4 at 0x100000 by thread 1:"));
    assert_eq!(*lines.last().unwrap(), "==================");
}
