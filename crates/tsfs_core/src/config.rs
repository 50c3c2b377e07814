//! Engine configuration.

use crate::blink::DEFAULT_NODE_SIZE;
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for opening an engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Store root directory.
    pub root: PathBuf,

    /// Whether to create the store if it doesn't exist.
    pub create_if_missing: bool,

    /// Index page size in bytes. Fixed for the lifetime of a store.
    pub node_size: usize,

    /// Index nodes cached per index.
    pub node_cache_nodes: usize,

    /// Upper bound on index nodes per index.
    pub max_index_nodes: u64,

    /// Upper bound on data files per kind.
    pub max_files: u64,

    /// Open data file handles kept cached.
    pub open_file_cache: usize,

    /// Total permits of the throttle.
    pub total_permits: usize,

    /// Permits consumed by a read.
    pub read_cost: usize,

    /// Permits consumed by a write.
    pub write_cost: usize,

    /// Smallest greedy grant worth waiting for.
    pub greedy_minimum: usize,

    /// Largest gap in bytes that one positioned read or write may span.
    pub gap_threshold: u64,

    /// Lifetime of a transaction before it is rolled back automatically.
    pub transaction_timeout: Duration,

    /// Longest wait for a per-identifier lock.
    pub lock_timeout: Duration,

    /// Whether to sync data files on every commit (safer but slower).
    pub sync_on_commit: bool,

    /// Whether `clean_file_store` may wipe the store.
    pub allow_cleanup: bool,

    /// Whether recovered external transactions are forgotten at startup
    /// instead of waiting for their coordinator.
    pub forget_xa_on_startup: bool,

    /// Whether to run the directory consistency check at startup.
    pub check_on_startup: bool,

    /// Most files in one leaf data directory.
    pub max_files_per_dir: u64,

    /// Fan-out of each directory hashing level.
    pub hash_bins: u64,

    /// Upper bound on worker threads of one transaction executor.
    pub executor_ceiling: usize,

    /// Period of the transaction deadline reaper.
    pub reaper_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("tsfs"),
            create_if_missing: true,
            node_size: DEFAULT_NODE_SIZE,
            node_cache_nodes: 1024,
            max_index_nodes: 1 << 24,
            max_files: 1 << 26,
            open_file_cache: 256,
            total_permits: 64,
            read_cost: 1,
            write_cost: 2,
            greedy_minimum: 1,
            gap_threshold: 4096,
            transaction_timeout: Duration::from_secs(300),
            lock_timeout: Duration::from_secs(60),
            sync_on_commit: true,
            allow_cleanup: false,
            forget_xa_on_startup: false,
            check_on_startup: false,
            max_files_per_dir: 1024,
            hash_bins: 256,
            executor_ceiling: 16,
            reaper_interval: Duration::from_secs(1),
        }
    }
}

impl EngineConfig {
    /// Creates a configuration for the store at `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    /// Sets whether to create the store if missing.
    #[must_use]
    pub const fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    /// Sets the index page size.
    #[must_use]
    pub const fn node_size(mut self, size: usize) -> Self {
        self.node_size = size;
        self
    }

    /// Sets the number of cached index nodes.
    #[must_use]
    pub const fn node_cache_nodes(mut self, nodes: usize) -> Self {
        self.node_cache_nodes = nodes;
        self
    }

    /// Sets the throttle capacity.
    #[must_use]
    pub const fn total_permits(mut self, permits: usize) -> Self {
        self.total_permits = permits;
        self
    }

    /// Sets the permit cost of reads and writes.
    #[must_use]
    pub const fn permit_costs(mut self, read: usize, write: usize) -> Self {
        self.read_cost = read;
        self.write_cost = write;
        self
    }

    /// Sets the smallest greedy grant.
    #[must_use]
    pub const fn greedy_minimum(mut self, permits: usize) -> Self {
        self.greedy_minimum = permits;
        self
    }

    /// Sets the I/O chunking gap threshold.
    #[must_use]
    pub const fn gap_threshold(mut self, bytes: u64) -> Self {
        self.gap_threshold = bytes;
        self
    }

    /// Sets the default transaction timeout.
    #[must_use]
    pub const fn transaction_timeout(mut self, timeout: Duration) -> Self {
        self.transaction_timeout = timeout;
        self
    }

    /// Sets the per-identifier lock timeout.
    #[must_use]
    pub const fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Sets whether to sync data files on every commit.
    #[must_use]
    pub const fn sync_on_commit(mut self, value: bool) -> Self {
        self.sync_on_commit = value;
        self
    }

    /// Sets whether destructive cleanup is allowed.
    #[must_use]
    pub const fn allow_cleanup(mut self, value: bool) -> Self {
        self.allow_cleanup = value;
        self
    }

    /// Sets whether recovered external transactions are forgotten at startup.
    #[must_use]
    pub const fn forget_xa_on_startup(mut self, value: bool) -> Self {
        self.forget_xa_on_startup = value;
        self
    }

    /// Sets whether the consistency check runs at startup.
    #[must_use]
    pub const fn check_on_startup(mut self, value: bool) -> Self {
        self.check_on_startup = value;
        self
    }

    /// Sets the directory hashing shape for new stores.
    #[must_use]
    pub const fn directory_hashing(mut self, bins: u64, max_files_per_dir: u64) -> Self {
        self.hash_bins = bins;
        self.max_files_per_dir = max_files_per_dir;
        self
    }

    /// Sets the executor thread ceiling.
    #[must_use]
    pub const fn executor_ceiling(mut self, threads: usize) -> Self {
        self.executor_ceiling = threads;
        self
    }

    /// Sets the deadline reaper period.
    #[must_use]
    pub const fn reaper_interval(mut self, interval: Duration) -> Self {
        self.reaper_interval = interval;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = EngineConfig::default();
        assert!(config.create_if_missing);
        assert!(config.sync_on_commit);
        assert!(!config.allow_cleanup);
        assert_eq!(config.node_size, 4096);
        assert_eq!(config.total_permits, 64);
        assert_eq!((config.read_cost, config.write_cost), (1, 2));
        assert_eq!(config.gap_threshold, 4096);
        assert_eq!(config.lock_timeout, Duration::from_secs(60));
    }

    #[test]
    fn builder_pattern() {
        let config = EngineConfig::new("/tmp/s")
            .create_if_missing(false)
            .sync_on_commit(false)
            .permit_costs(2, 5)
            .lock_timeout(Duration::from_millis(10));

        assert!(!config.create_if_missing);
        assert!(!config.sync_on_commit);
        assert_eq!(config.root, PathBuf::from("/tmp/s"));
        assert_eq!((config.read_cost, config.write_cost), (2, 5));
        assert_eq!(config.lock_timeout, Duration::from_millis(10));
    }
}
