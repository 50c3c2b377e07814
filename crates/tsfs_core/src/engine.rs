//! Engine context.

use crate::config::EngineConfig;
use crate::dir::EngineDir;
use crate::error::FsResult;
use crate::fsid::FsIdInterner;
use crate::recovery::{check_store, recover_store, CheckReport, RecoveryReport};
use crate::stats::EngineStats;
use crate::store::FileStore;
use crate::throttle::Throttle;
use crate::txn::{TransactionManager, TxLogDir};
use parking_lot::RwLock;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;
use uuid::Uuid;

/// One open store and everything that serves it.
///
/// There is one `Engine` per store directory per process; it holds the
/// store lock from [`open`](Self::open) until it is dropped.
///
/// # Opening
///
/// ```rust,ignore
/// use tsfs_core::{Engine, EngineConfig};
///
/// let engine = Engine::open(EngineConfig::new("/data/tsfs"))?;
/// let xid = engine.transactions().begin()?;
/// // ...
/// engine.shutdown()?;
/// ```
///
/// Opening runs recovery, so by the time `open` returns every transaction
/// of a previous run is either applied or gone, apart from external ones
/// waiting for their coordinator.
pub struct Engine {
    instance_id: Uuid,
    started: Instant,
    config: EngineConfig,
    store: Arc<FileStore>,
    txlog: Arc<TxLogDir>,
    manager: Arc<TransactionManager>,
    stats: Arc<EngineStats>,
    interner: FsIdInterner,
    recovery: RecoveryReport,
    startup_check: Option<CheckReport>,
    is_open: RwLock<bool>,
    // Dropped last: the lock outlives everything using the directory.
    dir: EngineDir,
}

impl Engine {
    /// Opens the store at `config.root`.
    ///
    /// # Errors
    ///
    /// Fails with `StoreLocked` if another engine holds the store and with
    /// `Recovery` if the logs left by a previous run cannot be resolved.
    pub fn open(config: EngineConfig) -> FsResult<Self> {
        let dir = EngineDir::open(&config.root, config.create_if_missing)?;
        let store = Arc::new(FileStore::open(&dir, &config)?);
        let txlog = Arc::new(TxLogDir::open(&dir.txlog_dir())?);
        let recovery = recover_store(&store, &txlog, &config)?;
        let startup_check = if config.check_on_startup {
            Some(check_store(&store, false)?)
        } else {
            None
        };

        let stats = Arc::new(EngineStats::new());
        let manager = TransactionManager::new(
            Arc::clone(&store),
            Arc::clone(&txlog),
            Throttle::from_config(&config),
            Arc::clone(&stats),
            config.clone(),
            recovery.heuristic.clone(),
        );
        manager.start_reaper()?;

        let instance_id = Uuid::new_v4();
        info!(
            %instance_id,
            root = %dir.path().display(),
            roots = store.roots().len(),
            pending_xa = recovery.heuristic.len(),
            "engine open"
        );
        Ok(Self {
            instance_id,
            started: Instant::now(),
            config,
            store,
            txlog,
            manager,
            stats,
            interner: FsIdInterner::new(),
            recovery,
            startup_check,
            is_open: RwLock::new(true),
            dir,
        })
    }

    /// Opens the store at `root` with default settings.
    pub fn open_path(root: &Path) -> FsResult<Self> {
        Self::open(EngineConfig::new(root))
    }

    /// Id of this engine instance, fresh on every open.
    #[must_use]
    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    /// Time since open.
    #[must_use]
    pub fn uptime(&self) -> std::time::Duration {
        self.started.elapsed()
    }

    /// Configuration the engine was opened with.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Store directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Indexes and data files.
    #[must_use]
    pub fn store(&self) -> &Arc<FileStore> {
        &self.store
    }

    /// Transaction logs.
    #[must_use]
    pub fn txlog(&self) -> &TxLogDir {
        &self.txlog
    }

    /// Transaction manager.
    #[must_use]
    pub fn transactions(&self) -> &Arc<TransactionManager> {
        &self.manager
    }

    /// Counters.
    #[must_use]
    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    /// Shared identifier table.
    #[must_use]
    pub fn interner(&self) -> &FsIdInterner {
        &self.interner
    }

    /// What recovery did at open.
    #[must_use]
    pub fn recovery_report(&self) -> &RecoveryReport {
        &self.recovery
    }

    /// Result of the startup consistency check, if one ran.
    #[must_use]
    pub fn startup_check(&self) -> Option<&CheckReport> {
        self.startup_check.as_ref()
    }

    /// Returns true until [`shutdown`](Self::shutdown).
    #[must_use]
    pub fn is_open(&self) -> bool {
        *self.is_open.read()
    }

    /// Rolls back active transactions and flushes the indexes.
    ///
    /// Prepared transactions keep their logs and are recovered at the next
    /// open. Calling this twice is harmless.
    pub fn shutdown(&self) -> FsResult<()> {
        let mut is_open = self.is_open.write();
        if !*is_open {
            return Ok(());
        }
        self.manager.shutdown()?;
        self.interner.purge();
        *is_open = false;
        info!(instance_id = %self.instance_id, "engine shut down");
        Ok(())
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if *self.is_open.read() {
            let _ = self.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StorageFault;

    #[test]
    fn second_open_is_refused_while_locked() {
        let temp = tempfile::tempdir().unwrap();
        let engine = Engine::open_path(temp.path()).unwrap();
        assert!(matches!(
            Engine::open_path(temp.path()),
            Err(StorageFault::StoreLocked { .. })
        ));
        engine.shutdown().unwrap();
        engine.shutdown().unwrap();
        drop(engine);
        let again = Engine::open_path(temp.path()).unwrap();
        assert!(again.recovery_report().is_clean());
    }

    #[test]
    fn instance_ids_differ_per_open() {
        let temp = tempfile::tempdir().unwrap();
        let first = Engine::open_path(temp.path()).unwrap().instance_id();
        let second = Engine::open_path(temp.path()).unwrap().instance_id();
        assert_ne!(first, second);
    }

    #[test]
    fn startup_check_runs_when_configured() {
        let temp = tempfile::tempdir().unwrap();
        let engine = Engine::open(EngineConfig::new(temp.path()).check_on_startup(true)).unwrap();
        assert!(engine.startup_check().is_some_and(CheckReport::is_clean));
        assert!(!temp.path().join("missing").exists());
        assert!(matches!(
            Engine::open(EngineConfig::new(temp.path().join("missing")).create_if_missing(false)),
            Err(_)
        ));
    }
}
