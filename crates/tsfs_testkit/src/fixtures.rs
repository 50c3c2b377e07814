//! Test fixtures and store helpers.
//!
//! Provides scratch stores and shortcuts for the writes and reads most
//! tests start with.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tsfs_core::{
    Engine, EngineConfig, ExistsPolicy, FileStoreBackend, FsId, FsResult, TimeSeriesCarrier,
    TransactionService, TransactionalBackend,
};

/// A store in a temporary directory, removed when dropped.
///
/// The backend must not be cloned past a [`reopen`](Self::reopen): the old
/// engine keeps the store locked until its last handle is gone.
pub struct TestStore {
    backend: Option<TransactionalBackend>,
    config: EngineConfig,
    temp_dir: TempDir,
}

impl TestStore {
    /// Opens an empty store with test settings.
    pub fn new() -> Self {
        Self::with_config(|c| c)
    }

    /// Opens an empty store, adjusting the test settings with `configure`.
    pub fn with_config(configure: impl FnOnce(EngineConfig) -> EngineConfig) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let config = configure(test_config(temp_dir.path()));
        let backend = open(&config).expect("Failed to open test store");
        Self {
            backend: Some(backend),
            config,
            temp_dir,
        }
    }

    /// Store directory.
    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Configuration the store is opened with.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The open backend.
    pub fn backend(&self) -> &TransactionalBackend {
        self.backend.as_ref().expect("store is closed")
    }

    /// The open engine.
    pub fn engine(&self) -> &Arc<Engine> {
        self.backend().engine()
    }

    /// Closes the engine and opens the store again, running recovery.
    pub fn reopen(&mut self) -> FsResult<()> {
        self.close();
        self.backend = Some(open(&self.config)?);
        Ok(())
    }

    /// Closes the engine, leaving the directory in place.
    pub fn close(&mut self) {
        // Dropping the last handle shuts the engine down and frees the lock.
        self.backend = None;
    }
}

impl Default for TestStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::ops::Deref for TestStore {
    type Target = TransactionalBackend;

    fn deref(&self) -> &Self::Target {
        self.backend()
    }
}

/// Engine settings for tests: no fsync, a fast reaper and short lock waits.
pub fn test_config(root: &Path) -> EngineConfig {
    EngineConfig::new(root)
        .sync_on_commit(false)
        .lock_timeout(Duration::from_secs(5))
        .reaper_interval(Duration::from_millis(20))
}

fn open(config: &EngineConfig) -> FsResult<TransactionalBackend> {
    Ok(TransactionalBackend::new(Arc::new(Engine::open(config.clone())?)))
}

/// Runs a test with a scratch store.
///
/// # Example
///
/// ```rust,ignore
/// use tsfs_testkit::with_temp_store;
///
/// #[test]
/// fn my_test() {
///     with_temp_store(|store| {
///         let xid = store.begin().unwrap();
///         // ... test operations
///     });
/// }
/// ```
pub fn with_temp_store<F, R>(f: F) -> R
where
    F: FnOnce(&TestStore) -> R,
{
    let store = TestStore::new();
    f(&store)
}

/// Parses an identifier, panicking on a malformed one.
pub fn fsid(id: &str) -> FsId {
    FsId::new(id).expect("valid identifier")
}

/// A fully valid int series over `[start, start + values.len() - 1]`.
pub fn int_series(id: &str, start: i64, values: &[i32], origin: u64) -> TimeSeriesCarrier {
    TimeSeriesCarrier::from_ints(fsid(id), start, values, origin).expect("valid series")
}

/// Writes an int series in overwrite mode and commits.
pub fn commit_ints<B: FileStoreBackend>(
    backend: &B,
    id: &str,
    start: i64,
    values: &[i32],
    origin: u64,
) -> FsResult<()> {
    commit_series(backend, vec![int_series(id, start, values, origin)], true)
}

/// Writes series in one transaction and commits.
pub fn commit_series<B: FileStoreBackend>(
    backend: &B,
    series: Vec<TimeSeriesCarrier>,
    overwrite: bool,
) -> FsResult<()> {
    let xid = backend.begin()?;
    if let Err(e) = backend.write_time_series(&xid, series, overwrite) {
        backend.rollback(&xid)?;
        return Err(e);
    }
    backend.commit(&xid, false)
}

/// Reads an int series in its own transaction. Missing ids read as empty.
pub fn read_ints<B: FileStoreBackend>(
    backend: &B,
    id: &str,
    start: i64,
    end: i64,
) -> FsResult<TimeSeriesCarrier> {
    let xid = backend.begin()?;
    let read = backend.read_time_series(
        &xid,
        &[fsid(id)],
        start,
        end,
        Some(tsfs_core::DataType::Int),
        ExistsPolicy::Empty,
    );
    backend.rollback(&xid)?;
    read?.pop().ok_or_else(|| tsfs_core::StorageFault::not_found(&fsid(id)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reopen_keeps_committed_data() {
        let mut store = TestStore::new();
        commit_ints(store.backend(), "/f/a", 5, &[1, 2, 3], 4).unwrap();
        store.reopen().unwrap();
        let read = read_ints(store.backend(), "/f/a", 5, 7).unwrap();
        assert!(read.exists);
        assert_eq!(read.ints(), vec![1, 2, 3]);
    }

    #[test]
    fn missing_series_read_as_empty() {
        with_temp_store(|store| {
            let read = read_ints(store.backend(), "/f/none", 0, 3).unwrap();
            assert!(!read.exists);
            assert!(read.valid.is_empty());
        });
    }
}
