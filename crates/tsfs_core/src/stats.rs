//! Engine statistics.
//!
//! All counters are atomic and can be read while operations are in
//! progress. Values only grow.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Engine counters.
#[derive(Debug, Default)]
pub struct EngineStats {
    // Operation counters
    reads: AtomicU64,
    writes: AtomicU64,
    deletes: AtomicU64,
    queries: AtomicU64,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,

    // Transaction counters
    transactions_started: AtomicU64,
    transactions_committed: AtomicU64,
    transactions_rolled_back: AtomicU64,
    transactions_timed_out: AtomicU64,
    read_only_prepares: AtomicU64,
    lock_waits: AtomicU64,

    // Error counters
    errors: AtomicU64,
    out_of_memory: AtomicU64,
}

impl EngineStats {
    /// Creates a new stats instance.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_read(&self, bytes: u64) {
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.bytes_read.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn record_write(&self, bytes: u64) {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn record_delete(&self) {
        self.deletes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_query(&self) {
        self.queries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_transaction_start(&self) {
        self.transactions_started.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_transaction_commit(&self) {
        self.transactions_committed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_transaction_rollback(&self) {
        self.transactions_rolled_back.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_transaction_timeout(&self) {
        self.transactions_timed_out.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_read_only_prepare(&self) {
        self.read_only_prepares.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_lock_wait(&self) {
        self.lock_waits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_out_of_memory(&self) {
        self.out_of_memory.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the total number of transactions committed.
    pub fn transactions_committed(&self) -> u64 {
        self.transactions_committed.load(Ordering::Relaxed)
    }

    /// Returns the total number of transactions rolled back.
    pub fn transactions_rolled_back(&self) -> u64 {
        self.transactions_rolled_back.load(Ordering::Relaxed)
    }

    /// Returns the number of lock acquisitions that had to wait.
    pub fn lock_waits(&self) -> u64 {
        self.lock_waits.load(Ordering::Relaxed)
    }

    /// Returns a snapshot of all stats.
    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            reads: load(&self.reads),
            writes: load(&self.writes),
            deletes: load(&self.deletes),
            queries: load(&self.queries),
            bytes_read: load(&self.bytes_read),
            bytes_written: load(&self.bytes_written),
            transactions_started: load(&self.transactions_started),
            transactions_committed: load(&self.transactions_committed),
            transactions_rolled_back: load(&self.transactions_rolled_back),
            transactions_timed_out: load(&self.transactions_timed_out),
            read_only_prepares: load(&self.read_only_prepares),
            lock_waits: load(&self.lock_waits),
            errors: load(&self.errors),
            out_of_memory: load(&self.out_of_memory),
            cache_hits: 0,
            cache_misses: 0,
        }
    }
}

/// A point-in-time snapshot of engine statistics.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct StatsSnapshot {
    /// Read operations.
    pub reads: u64,
    /// Write operations.
    pub writes: u64,
    /// Delete operations.
    pub deletes: u64,
    /// Id and path queries.
    pub queries: u64,
    /// Bytes returned by reads.
    pub bytes_read: u64,
    /// Bytes accepted by writes.
    pub bytes_written: u64,
    /// Transactions begun or started externally.
    pub transactions_started: u64,
    /// Transactions committed.
    pub transactions_committed: u64,
    /// Transactions rolled back, including timeouts.
    pub transactions_rolled_back: u64,
    /// Transactions rolled back by a deadline.
    pub transactions_timed_out: u64,
    /// Prepares that found nothing to write.
    pub read_only_prepares: u64,
    /// Lock acquisitions that had to wait.
    pub lock_waits: u64,
    /// Operations that failed.
    pub errors: u64,
    /// Operations that failed to allocate memory.
    pub out_of_memory: u64,
    /// Index node cache hits.
    pub cache_hits: u64,
    /// Index node cache misses.
    pub cache_misses: u64,
}
