//! Hot-path benchmarks for latgen-engine.
//!
//! - BufferPool alloc + free of a full batch
//! - Pacer departure scheduling
//! - Histogram update
//! - Probe marker write/read
//!
//! Run with: cargo bench --package latgen-engine

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

use latgen_engine::frame::{read_probe_marker, write_probe_marker, FrameTemplate, MacAddr};
use latgen_engine::histogram::Histogram;
use latgen_engine::loadgen::DEFAULT_BATCH_SIZE;
use latgen_engine::pacer::Pacer;
use latgen_engine::pool::{BufferPool, DEFAULT_BUF_SIZE, DEFAULT_POOL_SIZE};

// ─── Pool ────────────────────────────────────────────────────────────────

fn bench_pool_cycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("pool_cycle");
    group.throughput(Throughput::Elements(DEFAULT_BATCH_SIZE as u64));
    for frame_len in [60usize, 1514] {
        group.bench_function(format!("{frame_len}B"), |b| {
            let template = FrameTemplate::builder(MacAddr([2, 0, 0, 0, 0, 1]), MacAddr::BROADCAST).build();
            let mut pool = BufferPool::new(template, DEFAULT_POOL_SIZE, DEFAULT_BUF_SIZE);
            let mut batch = Vec::with_capacity(DEFAULT_BATCH_SIZE);
            b.iter(|| {
                pool.alloc(&mut batch, DEFAULT_BATCH_SIZE, black_box(frame_len));
                black_box(&batch);
                pool.free(&mut batch);
            });
        });
    }
    group.finish();
}

// ─── Pacer ───────────────────────────────────────────────────────────────

fn bench_pacer_schedule(c: &mut Criterion) {
    c.bench_function("pacer_schedule_10g", |b| {
        let mut pacer = Pacer::new(10_000).unwrap();
        let mut now = 0u64;
        b.iter(|| {
            now += 67;
            black_box(pacer.schedule(black_box(now), 60));
        });
    });
}

// ─── Histogram ───────────────────────────────────────────────────────────

fn bench_histogram_update(c: &mut Criterion) {
    c.bench_function("histogram_update", |b| {
        let mut hist = Histogram::new(1);
        let mut sample = 8_000u64;
        b.iter(|| {
            sample = (sample * 1_103_515_245 + 12_345) % 50_000;
            hist.update(black_box(sample));
        });
    });
}

// ─── Probe marker ────────────────────────────────────────────────────────

fn bench_probe_marker(c: &mut Criterion) {
    c.bench_function("probe_marker_write_read", |b| {
        let template = FrameTemplate::probe(MacAddr([2, 0, 0, 0, 0, 1]), MacAddr::BROADCAST);
        let mut pool = BufferPool::new(template, 1, DEFAULT_BUF_SIZE);
        let mut batch = Vec::new();
        pool.alloc(&mut batch, 1, 60);
        let mut seq = 0u32;
        b.iter(|| {
            seq = seq.wrapping_add(1);
            write_probe_marker(batch[0].as_mut_slice(), seq);
            black_box(read_probe_marker(batch[0].as_slice()));
        });
    });
}

criterion_group!(
    benches,
    bench_pool_cycle,
    bench_pacer_schedule,
    bench_histogram_update,
    bench_probe_marker,
);
criterion_main!(benches);
