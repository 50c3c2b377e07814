//! Stress tests for tsfs.
//!
//! These helpers drive many concurrent transactions over a small pool of
//! shared identifiers, so writers contend for the same locks and permits.

use crate::fixtures::{fsid, read_ints};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tsfs_core::{
    FaultClass, FileStoreBackend, FsResult, Interval, TimeSeriesCarrier, TransactionService,
};

/// Result of a stress test run.
#[derive(Debug, Clone)]
pub struct StressTestResult {
    /// Transactions committed.
    pub committed: usize,
    /// Transactions that failed and were rolled back.
    pub failed: usize,
    /// Failures that were lock or deadline timeouts.
    pub timeouts: usize,
    /// Total duration.
    pub duration: Duration,
    /// Committed transactions per second.
    pub commits_per_second: f64,
}

impl StressTestResult {
    fn new(committed: usize, failed: usize, timeouts: usize, duration: Duration) -> Self {
        let commits_per_second = if duration.as_secs_f64() > 0.0 {
            committed as f64 / duration.as_secs_f64()
        } else {
            0.0
        };
        Self {
            committed,
            failed,
            timeouts,
            duration,
            commits_per_second,
        }
    }

    /// Prints a summary of the test.
    pub fn print_summary(&self, name: &str) {
        println!("\n=== {} ===", name);
        println!("Committed: {}", self.committed);
        println!("Failed: {} ({} timeouts)", self.failed, self.timeouts);
        println!("Duration: {:?}", self.duration);
        println!("Throughput: {:.2} commits/sec", self.commits_per_second);
    }
}

/// Configuration for stress tests.
#[derive(Debug, Clone)]
pub struct StressConfig {
    /// Concurrent writer threads.
    pub threads: usize,
    /// Transactions each thread runs.
    pub transactions_per_thread: usize,
    /// Size of the shared identifier pool, named `/stress/<n>`.
    pub ids: usize,
    /// Cadences covered by the pool's series.
    pub cadences: i64,
    /// Cadences written per transaction.
    pub write_len: usize,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            threads: 4,
            transactions_per_thread: 50,
            ids: 8,
            cadences: 256,
            write_len: 16,
        }
    }
}

/// Identifier `n` of the stress pool.
pub fn stress_id(n: usize) -> String {
    format!("/stress/{n}")
}

/// Runs concurrent overwrite transactions over the shared pool.
///
/// Thread `t` writes the value `t + 1` and tags it with origin `t + 1`,
/// so in any serial order every cadence's value equals its origin; see
/// [`values_match_origins`].
pub fn concurrent_writers<B: FileStoreBackend>(
    backend: &B,
    config: &StressConfig,
) -> StressTestResult {
    let committed = AtomicUsize::new(0);
    let failed = AtomicUsize::new(0);
    let timeouts = AtomicUsize::new(0);
    let start = Instant::now();

    thread::scope(|s| {
        for t in 0..config.threads {
            let (committed, failed, timeouts) = (&committed, &failed, &timeouts);
            s.spawn(move || {
                let tag = t as u64 + 1;
                for i in 0..config.transactions_per_thread {
                    let id = stress_id((t + i) % config.ids.max(1));
                    let span = (config.cadences - config.write_len as i64).max(1);
                    let offset = ((t * 31 + i * 17) as i64) % span;
                    match write_once(backend, &id, offset, tag, config.write_len) {
                        Ok(()) => committed.fetch_add(1, Ordering::Relaxed),
                        Err(e) => {
                            if e.class() == FaultClass::TransactionTimeout {
                                timeouts.fetch_add(1, Ordering::Relaxed);
                            }
                            failed.fetch_add(1, Ordering::Relaxed)
                        }
                    };
                }
            });
        }
    });

    StressTestResult::new(
        committed.into_inner(),
        failed.into_inner(),
        timeouts.into_inner(),
        start.elapsed(),
    )
}

fn write_once<B: FileStoreBackend>(
    backend: &B,
    id: &str,
    start: i64,
    tag: u64,
    len: usize,
) -> FsResult<()> {
    let values = vec![tag as i32; len.max(1)];
    let series = TimeSeriesCarrier::from_ints(fsid(id), start, &values, tag)?;
    let xid = backend.begin()?;
    if let Err(e) = backend.write_time_series(&xid, vec![series], true) {
        // A timed-out transaction is already rolled back.
        let _ = backend.rollback(&xid);
        return Err(e);
    }
    backend.commit(&xid, false)
}

/// Returns true if every valid cadence of `id` in `[start, end]` holds the
/// value of its origin tag.
pub fn values_match_origins<B: FileStoreBackend>(
    backend: &B,
    id: &str,
    start: i64,
    end: i64,
) -> FsResult<bool> {
    let read = read_ints(backend, id, start, end)?;
    let ints = read.ints();
    for origin in read.origins.iter() {
        for cadence in origin.start()..=origin.end() {
            let Some(value) = usize::try_from(cadence - start).ok().and_then(|i| ints.get(i)) else {
                return Ok(false);
            };
            if *value as u64 != origin.tag {
                return Ok(false);
            }
        }
    }
    Ok(read.valid.covered() == read.origins.covered())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::TestStore;

    #[test]
    fn small_concurrent_run_keeps_values_and_origins_together() {
        let store = TestStore::new();
        let config = StressConfig {
            threads: 3,
            transactions_per_thread: 10,
            ids: 2,
            cadences: 64,
            write_len: 8,
        };
        let result = concurrent_writers(store.backend(), &config);
        assert_eq!(result.committed + result.failed, 30);
        assert_eq!(result.failed, 0);
        for n in 0..config.ids {
            assert!(values_match_origins(store.backend(), &stress_id(n), 0, 63).unwrap());
        }
    }
}
