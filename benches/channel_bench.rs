/*
Compares the two hand-off shapes used between pipeline stages: the single-slot
freshness buffer (capture -> filter, newest wins) and the bounded FIFO
(filter -> episode loop). A second case runs the freshness buffer with a writer
thread hammering it while the reader takes whatever is there.
*/

use std::{
    hint::black_box,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
};

use criterion::{Criterion, criterion_group, criterion_main};

use vcu_pipeline::vehicle::channel::{fresh, ordered};

fn bench_single_thread(c: &mut Criterion) {
    let mut group = c.benchmark_group("channel_put_get");

    group.bench_function("fresh_slot", |b| {
        let (tx, rx) = fresh::<u64>();
        b.iter(|| {
            tx.put(black_box(42));
            black_box(rx.get().ok())
        })
    });

    group.bench_function("ordered_fifo", |b| {
        let (tx, rx) = ordered::<u64>(8);
        b.iter(|| {
            let _ = tx.put(black_box(42));
            black_box(rx.try_get().ok())
        })
    });

    group.finish();
}

fn bench_contended_fresh(c: &mut Criterion) {
    let (tx, rx) = fresh::<u64>();
    let stop = Arc::new(AtomicBool::new(false));
    let writer = {
        let stop = stop.clone();
        thread::spawn(move || {
            let mut n = 0u64;
            while !stop.load(Ordering::Relaxed) {
                tx.put(n);
                n = n.wrapping_add(1);
            }
        })
    };

    c.bench_function("fresh_slot_contended_read", |b| {
        b.iter(|| black_box(rx.get().ok()))
    });

    stop.store(true, Ordering::Relaxed);
    let _ = writer.join();
    println!("overwritten while benchmarking: {}", rx.overwritten());
}

criterion_group!(benches, bench_single_thread, bench_contended_fresh);
criterion_main!(benches);
