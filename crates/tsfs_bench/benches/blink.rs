//! B-link tree benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::thread;
use tempfile::TempDir;
use tsfs_bench::{generate_ids, shuffled_ids};
use tsfs_core::blink::{FsIdIndex, DEFAULT_NODE_SIZE};

const CACHE_NODES: usize = 1024;

fn filled(count: usize) -> FsIdIndex {
    let tree = FsIdIndex::in_memory(DEFAULT_NODE_SIZE, CACHE_NODES).unwrap();
    for (n, id) in shuffled_ids(count).into_iter().enumerate() {
        tree.insert(id, n as u64).unwrap();
    }
    tree
}

/// Benchmark inserts in random order into an in-memory tree.
fn bench_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("blink_insert");

    for count in [1_000, 10_000].iter() {
        group.throughput(Throughput::Elements(*count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, &count| {
            let ids = shuffled_ids(count);
            b.iter(|| {
                let tree = FsIdIndex::in_memory(DEFAULT_NODE_SIZE, CACHE_NODES).unwrap();
                for (n, id) in ids.iter().enumerate() {
                    tree.insert(id.clone(), n as u64).unwrap();
                }
                black_box(tree.height().unwrap());
            });
        });
    }

    group.finish();
}

/// Benchmark point lookups.
fn bench_find(c: &mut Criterion) {
    let mut group = c.benchmark_group("blink_find");

    for count in [1_000, 100_000].iter() {
        let tree = filled(*count);
        let probes = shuffled_ids(*count);
        group.throughput(Throughput::Elements(probes.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &probes, |b, probes| {
            b.iter(|| {
                for id in probes {
                    black_box(tree.find(id).unwrap());
                }
            });
        });
    }

    group.finish();
}

/// Benchmark a full ordered scan and a prefix scan.
fn bench_scan(c: &mut Criterion) {
    let mut group = c.benchmark_group("blink_scan");
    let tree = filled(50_000);

    group.bench_function("full", |b| {
        b.iter(|| black_box(tree.iter().count()));
    });

    let from = generate_ids(50_000)[25_000].clone();
    group.bench_function("from_middle_100", |b| {
        b.iter(|| black_box(tree.iter_from(from.clone()).take(100).count()));
    });

    group.finish();
}

/// Benchmark concurrent inserts of disjoint key sets into one tree.
fn bench_concurrent_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("blink_concurrent_insert");
    group.sample_size(20);

    for threads in [1usize, 4].iter() {
        let per_thread = 5_000;
        group.throughput(Throughput::Elements((threads * per_thread) as u64));
        group.bench_with_input(BenchmarkId::from_parameter(threads), threads, |b, &threads| {
            let ids = shuffled_ids(threads * per_thread);
            b.iter(|| {
                let tree = FsIdIndex::in_memory(DEFAULT_NODE_SIZE, CACHE_NODES).unwrap();
                thread::scope(|s| {
                    for part in ids.chunks(per_thread) {
                        let tree = &tree;
                        s.spawn(move || {
                            for (n, id) in part.iter().enumerate() {
                                tree.insert(id.clone(), n as u64).unwrap();
                            }
                        });
                    }
                });
                black_box(tree.len().unwrap());
            });
        });
    }

    group.finish();
}

/// Benchmark lookups against a tree on disk whose cache is cold.
fn bench_file_find(c: &mut Criterion) {
    let mut group = c.benchmark_group("blink_file_find");
    group.sample_size(30);

    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("bench.idx");
    let tree = FsIdIndex::open(&path, DEFAULT_NODE_SIZE, 64, 1 << 20).unwrap();
    for (n, id) in generate_ids(20_000).into_iter().enumerate() {
        tree.insert(id, n as u64).unwrap();
    }
    tree.flush().unwrap();
    let probes = shuffled_ids(1_000);

    group.bench_function("cold_cache_1000", |b| {
        b.iter(|| {
            tree.invalidate_cache();
            for id in &probes {
                black_box(tree.find(id).unwrap());
            }
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_insert,
    bench_find,
    bench_scan,
    bench_concurrent_insert,
    bench_file_find,
);
criterion_main!(benches);
