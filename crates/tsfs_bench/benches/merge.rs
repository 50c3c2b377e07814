//! Interval list and chunking benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rand::Rng;
use tsfs_bench::random_intervals;
use tsfs_core::{
    IntervalSet, SimpleInterval, TaggedInterval, TimeSeriesIntervalIterator,
    TimeSeriesMergeIntervalIterator,
};

const GAP_THRESHOLD: u64 = 64;

/// Benchmark merging random intervals into a valid list.
fn bench_interval_merge(c: &mut Criterion) {
    let mut group = c.benchmark_group("interval_merge");

    for count in [100, 1_000, 10_000].iter() {
        let intervals = random_intervals(*count, 50, 200);
        group.throughput(Throughput::Elements(*count as u64));
        group.bench_with_input(BenchmarkId::new("simple", count), &intervals, |b, ivs| {
            b.iter(|| {
                let mut set = IntervalSet::new();
                for iv in ivs {
                    set.merge(*iv);
                }
                black_box(set.covered());
            });
        });
    }

    group.finish();
}

/// Benchmark origin overwrites: random tagged ranges over a long origin run.
fn bench_origin_overwrite(c: &mut Criterion) {
    let mut group = c.benchmark_group("origin_overwrite");
    let mut rng = rand::thread_rng();
    let writes: Vec<TaggedInterval> = (0..2_000)
        .map(|_| {
            let start = rng.gen_range(0..1_000_000);
            TaggedInterval::new(start, start + rng.gen_range(0..500), rng.gen_range(1..8))
        })
        .collect();

    group.throughput(Throughput::Elements(writes.len() as u64));
    group.bench_function("2000_writes", |b| {
        b.iter(|| {
            let mut origins = IntervalSet::from_intervals([TaggedInterval::new(0, 1_000_000, 0)]);
            for iv in &writes {
                origins.merge(*iv);
            }
            black_box(origins.len());
        });
    });

    group.bench_function("delete_interval", |b| {
        let base: IntervalSet<SimpleInterval> =
            IntervalSet::from_intervals(random_intervals(5_000, 50, 50));
        let (lo, hi) = base.bounds().unwrap_or((0, 0));
        b.iter(|| {
            let mut set = base.clone();
            set.delete_interval(lo + (hi - lo) / 4, hi - (hi - lo) / 4);
            black_box(set.len());
        });
    });

    group.finish();
}

/// Benchmark chunking in overwrite mode and in merge mode against existing data.
fn bench_chunking(c: &mut Criterion) {
    let mut group = c.benchmark_group("chunking");

    for count in [1_000, 10_000].iter() {
        let new = random_intervals(*count, 20, 100);
        let existing = random_intervals(*count, 20, 100);
        group.throughput(Throughput::Elements(*count as u64));

        group.bench_with_input(BenchmarkId::new("overwrite", count), &new, |b, new| {
            b.iter(|| black_box(TimeSeriesIntervalIterator::new(new, GAP_THRESHOLD).count()));
        });

        group.bench_with_input(
            BenchmarkId::new("merge", count),
            &(new.clone(), existing),
            |b, (new, existing)| {
                b.iter(|| {
                    let chunks =
                        TimeSeriesMergeIntervalIterator::new(new, existing, GAP_THRESHOLD).count();
                    black_box(chunks);
                });
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_interval_merge, bench_origin_overwrite, bench_chunking);
criterion_main!(benches);
