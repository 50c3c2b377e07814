//! Benchmark utilities.

use rand::seq::SliceRandom;
use rand::Rng;
use tsfs_core::{FsId, SimpleInterval};

/// Generate random bytes of the specified size.
pub fn random_data(size: usize) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    (0..size).map(|_| rng.gen()).collect()
}

/// Generate `count` identifiers spread over a few parent directories.
pub fn generate_ids(count: usize) -> Vec<FsId> {
    (0..count)
        .map(|i| {
            FsId::new(&format!("/bench/d{}/f{:08}", i % 37, i)).expect("valid identifier")
        })
        .collect()
}

/// The same identifiers in random order.
pub fn shuffled_ids(count: usize) -> Vec<FsId> {
    let mut ids = generate_ids(count);
    ids.shuffle(&mut rand::thread_rng());
    ids
}

/// `count` sorted, disjoint intervals of random length separated by random
/// gaps of at most `max_gap` positions.
pub fn random_intervals(count: usize, max_len: i64, max_gap: i64) -> Vec<SimpleInterval> {
    let mut rng = rand::thread_rng();
    let mut next = 0i64;
    (0..count)
        .map(|_| {
            let start = next + rng.gen_range(1..=max_gap.max(1));
            let end = start + rng.gen_range(0..max_len.max(1));
            next = end + 1;
            SimpleInterval::new(start, end)
        })
        .collect()
}
