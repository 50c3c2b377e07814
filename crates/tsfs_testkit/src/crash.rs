//! Crash recovery testing for tsfs.
//!
//! The harness runs a unit of work against a scratch store, stops it the
//! way a crash would, reopens the store and hands back what recovery did.
//!
//! A crash is simulated in process: the manager drops its in-memory
//! transactions without touching their logs, journals or files, and a
//! configured [`CrashPoint`] stops a commit between two durable steps.
//!
//! ## Test Strategy
//!
//! 1. **Crash before commit** - only a journal exists; nothing survives
//! 2. **Crash after prepare** - the prepared log is rolled back
//! 3. **Crash after the commit log** - recovery replays the commit
//! 4. **Crash after apply** - replaying an applied commit changes nothing
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tsfs_testkit::crash::{CrashHarness, Presence};
//! use tsfs_core::CrashPoint;
//!
//! let mut harness = CrashHarness::new();
//! let expected = int_series("/z", 0, &[1, 2, 3], 1);
//! harness.crash_in_commit(CrashPoint::AfterCommitLog, |b, xid| {
//!     b.write_time_series(xid, vec![expected.clone()], true)
//! })?;
//! assert_eq!(harness.presence(&expected)?, Presence::Complete);
//! ```

use crate::fixtures::TestStore;
use tracing::info;
use tsfs_core::{
    CrashPoint, EngineConfig, ExistsPolicy, FileStoreBackend, FsResult, GlobalXid,
    RecoveryReport, StorageFault, TimeSeriesCarrier, TransactionService, TransactionalBackend,
    Vote, Xid,
};

/// How much of a written series a store holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    /// No trace of the series.
    Absent,
    /// Every cadence with the written values and origins.
    Complete,
    /// Anything else.
    Partial,
}

/// Runs work, crashes, and recovers.
pub struct CrashHarness {
    store: TestStore,
}

impl CrashHarness {
    /// Creates a harness over a fresh scratch store.
    pub fn new() -> Self {
        Self {
            store: TestStore::new(),
        }
    }

    /// Creates a harness whose store uses adjusted settings.
    pub fn with_config(configure: impl FnOnce(EngineConfig) -> EngineConfig) -> Self {
        Self {
            store: TestStore::with_config(configure),
        }
    }

    /// The store under test.
    pub fn store(&self) -> &TestStore {
        &self.store
    }

    /// Backend of the currently open engine.
    pub fn backend(&self) -> &TransactionalBackend {
        self.store.backend()
    }

    /// Runs `work` in a local transaction and crashes before committing.
    pub fn crash_before_commit<F>(&mut self, work: F) -> FsResult<RecoveryReport>
    where
        F: FnOnce(&TransactionalBackend, &Xid) -> FsResult<()>,
    {
        let backend = self.store.backend();
        let xid = backend.begin()?;
        work(backend, &xid)?;
        self.crash_and_recover()
    }

    /// Runs `work` in a local transaction and commits it with a crash at
    /// `point`.
    ///
    /// # Errors
    ///
    /// Fails with `InvalidOperation` if the commit was not stopped at the
    /// crash point.
    pub fn crash_in_commit<F>(&mut self, point: CrashPoint, work: F) -> FsResult<RecoveryReport>
    where
        F: FnOnce(&TransactionalBackend, &Xid) -> FsResult<()>,
    {
        let backend = self.store.backend();
        let xid = backend.begin()?;
        work(backend, &xid)?;
        backend.engine().transactions().set_crash_point(Some(point));
        match backend.commit(&xid, true) {
            Err(StorageFault::SimulatedCrash(_)) => {}
            Err(e) => return Err(e),
            Ok(()) => {
                return Err(StorageFault::invalid_operation(format!(
                    "commit of {xid} ran past {point:?}"
                )))
            }
        }
        self.crash_and_recover()
    }

    /// Runs `work` in an external transaction, prepares it and crashes
    /// before the coordinator decides.
    pub fn crash_after_external_prepare<F>(
        &mut self,
        gxid: GlobalXid,
        work: F,
    ) -> FsResult<RecoveryReport>
    where
        F: FnOnce(&TransactionalBackend, &Xid) -> FsResult<()>,
    {
        let backend = self.store.backend();
        let xid = backend.start_external(gxid, None)?;
        work(backend, &xid)?;
        if backend.prepare(&xid)? == Vote::ReadOnly {
            return Err(StorageFault::invalid_operation(format!(
                "{xid} wrote nothing"
            )));
        }
        self.crash_and_recover()
    }

    /// Abandons all in-flight transactions, closes the engine and reopens
    /// the store. Returns the recovery report of the new engine.
    pub fn crash_and_recover(&mut self) -> FsResult<RecoveryReport> {
        let abandoned = self.store.engine().transactions().simulate_crash();
        self.store.reopen()?;
        let report = self.store.engine().recovery_report().clone();
        info!(
            abandoned,
            replayed = report.replayed.len(),
            rolled_back = report.rolled_back.len(),
            "recovered after simulated crash"
        );
        Ok(report)
    }

    /// Compares the committed state of `expected.id` with `expected`.
    pub fn presence(&self, expected: &TimeSeriesCarrier) -> FsResult<Presence> {
        presence(self.store.backend(), expected)
    }
}

impl Default for CrashHarness {
    fn default() -> Self {
        Self::new()
    }
}

/// Compares the committed state of `expected.id` in `backend` with `expected`.
pub fn presence<B: FileStoreBackend>(
    backend: &B,
    expected: &TimeSeriesCarrier,
) -> FsResult<Presence> {
    let xid = backend.begin()?;
    let read = backend.read_time_series(
        &xid,
        std::slice::from_ref(&expected.id),
        expected.start_cadence,
        expected.end_cadence,
        Some(expected.data_type),
        ExistsPolicy::Empty,
    );
    backend.rollback(&xid)?;
    let Some(found) = read?.pop() else {
        return Ok(Presence::Absent);
    };
    if !found.exists {
        return Ok(Presence::Absent);
    }
    let complete = found.valid == expected.valid
        && found.origins == expected.origins
        && expected
            .valid
            .iter()
            .flat_map(|iv| iv.start..=iv.end)
            .all(|c| found.element(c) == expected.element(c));
    Ok(if complete {
        Presence::Complete
    } else {
        Presence::Partial
    })
}
