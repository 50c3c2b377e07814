//! Backend façade.
//!
//! [`TransactionService`] is the transaction half of the API and
//! [`FileStoreBackend`] adds the data operations. [`TransactionalBackend`]
//! implements both over an [`Engine`]; protocol layers and tools hold it
//! as `Arc<dyn FileStoreBackend>`.

use crate::carrier::{BlobCarrier, MjdTimeSeries, TimeSeriesCarrier};
use crate::engine::Engine;
use crate::error::{FsResult, StorageFault};
use crate::fsid::FsId;
use crate::query::{parent_paths, FsQuery};
use crate::scheduler::{reassemble, Scheduler};
use crate::stats::StatsSnapshot;
use crate::txn::{BatchLocks, LockMode, TransactionState, TxnScope};
use crate::types::{DataType, FileKind, GlobalXid, Vote, Xid};
use crate::xfile::CadenceIntervals;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// What a read of a missing identifier returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExistsPolicy {
    /// Fail with `NotFound`.
    Error,
    /// Return an empty result marked as not existing.
    #[default]
    Empty,
}

/// Transaction lifecycle.
pub trait TransactionService: Send + Sync {
    /// Begins a local transaction.
    fn begin(&self) -> FsResult<Xid>;
    /// Starts a branch of an externally coordinated transaction.
    fn start_external(&self, xid: GlobalXid, timeout: Option<Duration>) -> FsResult<Xid>;
    /// First phase of two-phase commit.
    fn prepare(&self, xid: &Xid) -> FsResult<Vote>;
    /// Commits; `one_phase` skips a separate prepare.
    fn commit(&self, xid: &Xid, one_phase: bool) -> FsResult<()>;
    /// Rolls back.
    fn rollback(&self, xid: &Xid) -> FsResult<()>;
    /// Forgets a heuristically completed transaction.
    fn forget(&self, xid: &Xid) -> FsResult<()>;
    /// External transactions waiting for a coordinator decision.
    fn recover(&self) -> FsResult<Vec<Xid>>;
    /// Moves the deadline of a transaction.
    fn set_timeout(&self, xid: &Xid, timeout: Duration) -> FsResult<()>;
    /// Returns true if nothing was written so far.
    fn is_read_only(&self, xid: &Xid) -> FsResult<bool>;
}

/// Data operations, all inside a transaction unless noted.
pub trait FileStoreBackend: TransactionService {
    /// Reads `[start, end]` of each series, in request order.
    fn read_time_series(
        &self,
        xid: &Xid,
        ids: &[FsId],
        start: i64,
        end: i64,
        expected: Option<DataType>,
        policy: ExistsPolicy,
    ) -> FsResult<Vec<TimeSeriesCarrier>>;

    /// Writes series; `overwrite` replaces the covered range, otherwise the
    /// new intervals are merged with the existing ones.
    fn write_time_series(
        &self,
        xid: &Xid,
        series: Vec<TimeSeriesCarrier>,
        overwrite: bool,
    ) -> FsResult<()>;

    /// Removes `[start, end]` from a series. Returns false if it does not exist.
    fn delete_time_series_interval(
        &self,
        xid: &Xid,
        id: &FsId,
        start: i64,
        end: i64,
    ) -> FsResult<bool>;

    /// Reads a blob.
    fn read_blob(&self, xid: &Xid, id: &FsId, policy: ExistsPolicy) -> FsResult<BlobCarrier>;

    /// Replaces a blob.
    fn write_blob(&self, xid: &Xid, id: &FsId, origin: u64, data: &[u8]) -> FsResult<()>;

    /// Reads the points of each MJD series within `[start_mjd, end_mjd]`.
    fn read_mjd_series(
        &self,
        xid: &Xid,
        ids: &[FsId],
        start_mjd: f64,
        end_mjd: f64,
        policy: ExistsPolicy,
    ) -> FsResult<Vec<MjdTimeSeries>>;

    /// Writes MJD series, replacing the points within each series' range.
    fn write_mjd_series(&self, xid: &Xid, series: Vec<MjdTimeSeries>) -> FsResult<()>;

    /// Deletes series. Returns how many existed.
    fn delete_time_series(&self, xid: &Xid, ids: &[FsId]) -> FsResult<usize>;

    /// Deletes a blob. Returns false if it did not exist.
    fn delete_blob(&self, xid: &Xid, id: &FsId) -> FsResult<bool>;

    /// Deletes MJD series. Returns how many existed.
    fn delete_mjd_series(&self, xid: &Xid, ids: &[FsId]) -> FsResult<usize>;

    /// Existence of each id, as seen by the transaction.
    fn file_exists(&self, xid: &Xid, kind: FileKind, ids: &[FsId]) -> FsResult<Vec<bool>>;

    /// Valid and origin cadences of each series, `None` where it does not exist.
    fn get_cadence_intervals(
        &self,
        xid: &Xid,
        ids: &[FsId],
    ) -> FsResult<Vec<Option<CadenceIntervals>>>;

    /// Committed ids matching a query. Runs outside any transaction.
    fn query_ids(&self, query: &str) -> FsResult<Vec<FsId>>;

    /// Distinct parent paths of the committed ids matching a query.
    fn query_paths(&self, query: &str) -> FsResult<Vec<String>>;

    /// Diagnostics.
    fn status(&self) -> FsResult<StatusReport>;

    /// Deletes all data. Refused unless cleanup is enabled.
    fn clean_file_store(&self) -> FsResult<u64>;

    /// Stops the engine.
    fn shutdown(&self) -> FsResult<()>;
}

/// Diagnostics dump.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    /// Engine instance.
    pub instance_id: String,
    /// Store directory.
    pub root: String,
    /// Seconds since open.
    pub uptime_secs: u64,
    /// Active transactions with their state.
    pub active_transactions: Vec<TransactionStatus>,
    /// Recovered external transactions and their outcomes.
    pub recovered_transactions: Vec<TransactionStatus>,
    /// Throttle capacity.
    pub permits_total: usize,
    /// Permits currently free.
    pub permits_available: usize,
    /// Mapped identifiers per kind.
    pub files: Vec<(FileKind, u64)>,
    /// Counters.
    pub stats: StatsSnapshot,
}

/// One transaction in a [`StatusReport`].
#[derive(Debug, Clone, Serialize)]
pub struct TransactionStatus {
    /// Transaction id.
    pub xid: String,
    /// State, as text.
    pub state: String,
}

/// Production backend over one engine.
#[derive(Clone)]
pub struct TransactionalBackend {
    engine: Arc<Engine>,
}

impl TransactionalBackend {
    /// Wraps an open engine.
    #[must_use]
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    /// The engine served.
    #[must_use]
    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    fn missing(kind: FileKind, id: &FsId, policy: ExistsPolicy) -> FsResult<()> {
        match policy {
            ExistsPolicy::Error => Err(StorageFault::not_found(id)),
            ExistsPolicy::Empty => {
                debug!(?kind, fsid = %id, "missing identifier read as empty");
                Ok(())
            }
        }
    }

    /// Runs `task` for `ids` in locality order and returns results in
    /// request order.
    fn scheduled_read<R, F>(&self, xid: &Xid, kind: FileKind, ids: &[FsId], task: F) -> FsResult<Vec<R>>
    where
        R: Send,
        F: Fn(&TxnScope<'_>, &FsId) -> FsResult<R> + Sync,
    {
        let chunks = ids.len().min(self.engine.config().executor_ceiling);
        let scheduled = Scheduler::new(chunks).schedule(
            self.engine.store().as_ref(),
            kind,
            ids.to_vec(),
            |id| id,
        )?;
        let locks = BatchLocks::shared(kind, ids.iter().cloned());
        let done = self
            .engine
            .transactions()
            .run_batch(xid, locks, scheduled, |scope, chunk| {
                chunk
                    .into_iter()
                    .map(|s| task(scope, &s.item).map(|r| (s.order, r)))
                    .collect::<FsResult<Vec<_>>>()
            })?;
        Ok(reassemble(done))
    }
}

impl TransactionService for TransactionalBackend {
    fn begin(&self) -> FsResult<Xid> {
        self.engine.transactions().begin()
    }

    fn start_external(&self, xid: GlobalXid, timeout: Option<Duration>) -> FsResult<Xid> {
        self.engine.transactions().start_external(xid, timeout)
    }

    fn prepare(&self, xid: &Xid) -> FsResult<Vote> {
        self.engine.transactions().prepare(xid)
    }

    fn commit(&self, xid: &Xid, one_phase: bool) -> FsResult<()> {
        self.engine.transactions().commit(xid, one_phase)
    }

    fn rollback(&self, xid: &Xid) -> FsResult<()> {
        self.engine.transactions().rollback(xid)
    }

    fn forget(&self, xid: &Xid) -> FsResult<()> {
        self.engine.transactions().forget(xid)
    }

    fn recover(&self) -> FsResult<Vec<Xid>> {
        Ok(self.engine.transactions().recover())
    }

    fn set_timeout(&self, xid: &Xid, timeout: Duration) -> FsResult<()> {
        self.engine.transactions().set_timeout(xid, timeout)
    }

    fn is_read_only(&self, xid: &Xid) -> FsResult<bool> {
        self.engine.transactions().is_read_only(xid)
    }
}

impl FileStoreBackend for TransactionalBackend {
    fn read_time_series(
        &self,
        xid: &Xid,
        ids: &[FsId],
        start: i64,
        end: i64,
        expected: Option<DataType>,
        policy: ExistsPolicy,
    ) -> FsResult<Vec<TimeSeriesCarrier>> {
        let stats = self.engine.stats();
        self.scheduled_read(xid, FileKind::TimeSeries, ids, |scope, id| {
            scope.file(FileKind::TimeSeries, id, LockMode::Shared, |ctx, io| {
                match ctx.read_series(io, expected, start, end)? {
                    Some(carrier) => {
                        stats.record_read(carrier.data.len() as u64);
                        Ok(carrier)
                    }
                    None => {
                        Self::missing(FileKind::TimeSeries, id, policy)?;
                        let data_type = expected.unwrap_or(DataType::Int);
                        Ok(TimeSeriesCarrier::empty(id.clone(), data_type, start, end, false))
                    }
                }
            })
        })
    }

    fn write_time_series(
        &self,
        xid: &Xid,
        series: Vec<TimeSeriesCarrier>,
        overwrite: bool,
    ) -> FsResult<()> {
        for carrier in &series {
            carrier.validate()?;
        }
        let stats = self.engine.stats();
        let locks =
            BatchLocks::exclusive(FileKind::TimeSeries, series.iter().map(|c| c.id.clone()));
        self.engine
            .transactions()
            .run_batch(xid, locks, group_by_id(series, |c| &c.id), |scope, group| {
                for carrier in group {
                    scope.file(FileKind::TimeSeries, &carrier.id, LockMode::Exclusive, |ctx, io| {
                        ctx.write_series(io, &carrier, overwrite)
                    })?;
                    stats.record_write(carrier.data.len() as u64);
                }
                Ok(())
            })?;
        Ok(())
    }

    fn delete_time_series_interval(
        &self,
        xid: &Xid,
        id: &FsId,
        start: i64,
        end: i64,
    ) -> FsResult<bool> {
        let locks = BatchLocks::exclusive(FileKind::TimeSeries, [id.clone()]);
        let out = self
            .engine
            .transactions()
            .run_batch(xid, locks, vec![id.clone()], |scope, id| {
                scope.file(FileKind::TimeSeries, &id, LockMode::Exclusive, |ctx, _| {
                    ctx.delete_series_interval(start, end)
                })
            })?;
        Ok(out.into_iter().any(|existed| existed))
    }

    fn read_blob(&self, xid: &Xid, id: &FsId, policy: ExistsPolicy) -> FsResult<BlobCarrier> {
        let stats = self.engine.stats();
        let locks = BatchLocks::shared(FileKind::Blob, [id.clone()]);
        let mut out = self
            .engine
            .transactions()
            .run_batch(xid, locks, vec![id.clone()], |scope, id| {
                scope.file(FileKind::Blob, &id, LockMode::Shared, |ctx, io| {
                    match ctx.read_blob(io)? {
                        Some(blob) => {
                            stats.record_read(blob.data.len() as u64);
                            Ok(blob)
                        }
                        None => {
                            Self::missing(FileKind::Blob, &id, policy)?;
                            Ok(BlobCarrier {
                                id: id.clone(),
                                origin: 0,
                                data: Vec::new(),
                                exists: false,
                            })
                        }
                    }
                })
            })?;
        out.pop()
            .ok_or_else(|| StorageFault::invalid_operation("blob read returned nothing"))
    }

    fn write_blob(&self, xid: &Xid, id: &FsId, origin: u64, data: &[u8]) -> FsResult<()> {
        let locks = BatchLocks::exclusive(FileKind::Blob, [id.clone()]);
        self.engine
            .transactions()
            .run_batch(xid, locks, vec![id.clone()], |scope, id| {
                scope.file(FileKind::Blob, &id, LockMode::Exclusive, |ctx, io| {
                    ctx.write_blob(io, origin, data)
                })
            })?;
        self.engine.stats().record_write(data.len() as u64);
        Ok(())
    }

    fn read_mjd_series(
        &self,
        xid: &Xid,
        ids: &[FsId],
        start_mjd: f64,
        end_mjd: f64,
        policy: ExistsPolicy,
    ) -> FsResult<Vec<MjdTimeSeries>> {
        if start_mjd.is_nan() || end_mjd.is_nan() || start_mjd > end_mjd {
            return Err(StorageFault::invalid_operation(format!(
                "empty mjd range [{start_mjd}, {end_mjd}]"
            )));
        }
        let stats = self.engine.stats();
        self.scheduled_read(xid, FileKind::Mjd, ids, |scope, id| {
            scope.file(FileKind::Mjd, id, LockMode::Shared, |ctx, io| {
                match ctx.read_mjd(io, start_mjd, end_mjd)? {
                    Some(series) => {
                        stats.record_read(
                            (series.points.len() * crate::carrier::MJD_POINT_SIZE) as u64,
                        );
                        Ok(series)
                    }
                    None => {
                        Self::missing(FileKind::Mjd, id, policy)?;
                        let mut empty =
                            MjdTimeSeries::new(id.clone(), start_mjd, end_mjd, Vec::new())?;
                        empty.exists = false;
                        Ok(empty)
                    }
                }
            })
        })
    }

    fn write_mjd_series(&self, xid: &Xid, series: Vec<MjdTimeSeries>) -> FsResult<()> {
        for s in &series {
            s.validate()?;
        }
        let stats = self.engine.stats();
        let locks = BatchLocks::exclusive(FileKind::Mjd, series.iter().map(|s| s.id.clone()));
        self.engine
            .transactions()
            .run_batch(xid, locks, group_by_id(series, |s| &s.id), |scope, group| {
                for s in group {
                    scope.file(FileKind::Mjd, &s.id, LockMode::Exclusive, |ctx, io| {
                        ctx.write_mjd(io, &s)
                    })?;
                    stats.record_write((s.points.len() * crate::carrier::MJD_POINT_SIZE) as u64);
                }
                Ok(())
            })?;
        Ok(())
    }

    fn delete_time_series(&self, xid: &Xid, ids: &[FsId]) -> FsResult<usize> {
        delete_all(self, xid, FileKind::TimeSeries, ids)
    }

    fn delete_blob(&self, xid: &Xid, id: &FsId) -> FsResult<bool> {
        Ok(delete_all(self, xid, FileKind::Blob, std::slice::from_ref(id))? == 1)
    }

    fn delete_mjd_series(&self, xid: &Xid, ids: &[FsId]) -> FsResult<usize> {
        delete_all(self, xid, FileKind::Mjd, ids)
    }

    fn file_exists(&self, xid: &Xid, kind: FileKind, ids: &[FsId]) -> FsResult<Vec<bool>> {
        self.scheduled_read(xid, kind, ids, |scope, id| {
            scope.file(kind, id, LockMode::Shared, |ctx, _| Ok(ctx.exists()))
        })
    }

    fn get_cadence_intervals(
        &self,
        xid: &Xid,
        ids: &[FsId],
    ) -> FsResult<Vec<Option<CadenceIntervals>>> {
        self.scheduled_read(xid, FileKind::TimeSeries, ids, |scope, id| {
            scope.file(FileKind::TimeSeries, id, LockMode::Shared, |ctx, _| {
                ctx.cadence_intervals()
            })
        })
    }

    fn query_ids(&self, query: &str) -> FsResult<Vec<FsId>> {
        let query = FsQuery::parse(query)?;
        self.engine.stats().record_query();
        let interner = self.engine.interner();
        query
            .scan(self.engine.store())?
            .iter()
            .map(|id| interner.intern(id.as_str()))
            .collect()
    }

    fn query_paths(&self, query: &str) -> FsResult<Vec<String>> {
        let query = FsQuery::parse(query)?;
        self.engine.stats().record_query();
        Ok(parent_paths(&query.scan(self.engine.store())?))
    }

    fn status(&self) -> FsResult<StatusReport> {
        let engine = &self.engine;
        let manager = engine.transactions();
        let store = engine.store();
        let mut stats = engine.stats().snapshot();
        (stats.cache_hits, stats.cache_misses) = store.cache_counters();
        let files = FileKind::ALL
            .iter()
            .map(|&kind| Ok((kind, store.index(kind).len()?)))
            .collect::<FsResult<Vec<_>>>()?;
        Ok(StatusReport {
            instance_id: engine.instance_id().to_string(),
            root: engine.path().display().to_string(),
            uptime_secs: engine.uptime().as_secs(),
            active_transactions: manager
                .active_transactions()
                .into_iter()
                .map(|(xid, state)| TransactionStatus {
                    xid: xid.to_string(),
                    state: state_text(state),
                })
                .collect(),
            recovered_transactions: manager
                .recovered_transactions()
                .into_iter()
                .map(|(xid, outcome)| TransactionStatus {
                    xid: xid.to_string(),
                    state: outcome.to_string(),
                })
                .collect(),
            permits_total: manager.throttle().total(),
            permits_available: manager.throttle().available(),
            files,
            stats,
        })
    }

    fn clean_file_store(&self) -> FsResult<u64> {
        if !self.engine.config().allow_cleanup {
            return Err(StorageFault::CleanupDisabled);
        }
        let active = self.engine.transactions().active_transactions();
        if !active.is_empty() {
            return Err(StorageFault::invalid_operation(format!(
                "{} transactions are active",
                active.len()
            )));
        }
        let removed = self.engine.store().wipe()?;
        info!(removed, "file store cleaned");
        Ok(removed)
    }

    fn shutdown(&self) -> FsResult<()> {
        self.engine.shutdown()
    }
}

fn delete_all(
    backend: &TransactionalBackend,
    xid: &Xid,
    kind: FileKind,
    ids: &[FsId],
) -> FsResult<usize> {
    let stats = backend.engine.stats();
    let locks = BatchLocks::exclusive(kind, ids.iter().cloned());
    let deleted = backend
        .engine
        .transactions()
        .run_batch(xid, locks, ids.to_vec(), |scope, id| {
            scope.file(kind, &id, LockMode::Exclusive, |ctx, _| Ok(ctx.delete()))
        })?;
    let count = deleted.into_iter().filter(|d| *d).count();
    for _ in 0..count {
        stats.record_delete();
    }
    Ok(count)
}

/// Splits a write batch into one group per identifier. Groups run in
/// parallel; writes inside a group keep their request order.
fn group_by_id<T>(items: Vec<T>, id: impl Fn(&T) -> &FsId) -> Vec<Vec<T>> {
    let mut slots: HashMap<FsId, usize> = HashMap::new();
    let mut groups: Vec<Vec<T>> = Vec::new();
    for item in items {
        let slot = *slots.entry(id(&item).clone()).or_insert_with(|| {
            groups.push(Vec::new());
            groups.len() - 1
        });
        groups[slot].push(item);
    }
    groups
}

fn state_text(state: TransactionState) -> String {
    match state {
        TransactionState::Active => "active".into(),
        TransactionState::Prepared { read_only: true } => "prepared (read-only)".into(),
        TransactionState::Prepared { read_only: false } => "prepared".into(),
        TransactionState::Committed => "committed".into(),
        TransactionState::RolledBack => "rolled back".into(),
        TransactionState::Heuristic(outcome) => outcome.to_string(),
    }
}
