//! Hot-path latency: one sized memory access through the full handler.

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use centinela::{Engine, Flags};

fn bench_accesses(c: &mut Criterion) {
    let flags = Flags {
        collect_stats: false,
        ..Flags::default()
    };
    let engine = Arc::new(Engine::new(flags).unwrap());
    let mut main = engine.start_main_thread();

    c.bench_function("write_same_cell", |b| {
        b.iter(|| main.memory_write(0x100, black_box(0x10_0000), 3));
    });

    c.bench_function("write_striding_cells", |b| {
        let mut i = 0u64;
        b.iter(|| {
            main.memory_write(0x100, black_box(0x20_0000 + (i % 4096) * 8), 3);
            i += 1;
        });
    });

    c.bench_function("read_after_write_same_cell", |b| {
        main.memory_write(0x100, 0x30_0000, 3);
        b.iter(|| main.memory_read(0x104, black_box(0x30_0000), 3));
    });

    c.bench_function("ignored_access", |b| {
        main.ignore_reads_begin();
        main.ignore_writes_begin();
        b.iter(|| main.memory_write(0x100, black_box(0x40_0000), 3));
        main.ignore_writes_end();
        main.ignore_reads_end();
    });

    c.bench_function("func_enter_exit_pair", |b| {
        b.iter(|| {
            main.func_enter(black_box(0x1000));
            main.func_exit();
        });
    });

    c.bench_function("range_access_64_bytes", |b| {
        b.iter(|| main.memory_access_range(0x100, black_box(0x50_0000), 64, true));
    });
}

criterion_group!(benches, bench_accesses);
criterion_main!(benches);
