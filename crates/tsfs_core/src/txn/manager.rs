//! Transaction manager.

use crate::config::EngineConfig;
use crate::error::{FaultClass, FsResult, StorageFault};
use crate::fsid::FsId;
use crate::stats::EngineStats;
use crate::store::FileStore;
use crate::throttle::{AcquiredPermits, Throttle};
use crate::txn::executor::BoundedExecutor;
use crate::txn::journal::{FilePlan, Journal};
use crate::txn::lock::{Acquired, LockKey, LockMode, LockTable};
use crate::txn::log::{LogState, LoggedFile, StateLog, TxLogDir};
use crate::txn::state::{Transaction, TransactionState};
use crate::types::{FileKind, GlobalXid, HeuristicOutcome, TransactionId, Vote, Xid};
use crate::xfile::{apply_plan, apply_plan_index, FileContext, FileIo};
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Stage of a commit at which a simulated crash stops it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrashPoint {
    /// After the prepared log is durable.
    AfterPrepare,
    /// After the committing log is durable, before any file is touched.
    AfterCommitLog,
    /// After all files and indexes are updated, before the log is removed.
    AfterApply,
}

/// Owns the lifecycle of every transaction.
///
/// Local transactions are begun with [`begin`](Self::begin) and committed in
/// one phase. External transactions are started with an id chosen by a
/// coordinator and follow the prepare / commit protocol; after a crash they
/// may be left heuristically completed until the coordinator forgets them.
pub struct TransactionManager {
    store: Arc<FileStore>,
    txlog: Arc<TxLogDir>,
    locks: LockTable,
    throttle: Throttle,
    stats: Arc<EngineStats>,
    config: EngineConfig,
    active: RwLock<HashMap<Xid, Arc<Transaction>>>,
    /// Recovered external transactions and how they were completed.
    recovered: Mutex<HashMap<Xid, HeuristicOutcome>>,
    /// Transactions rolled back by their deadline.
    timed_out: Mutex<HashSet<Xid>>,
    shutting_down: AtomicBool,
    crash_point: Mutex<Option<CrashPoint>>,
    reaper: Mutex<Option<JoinHandle<()>>>,
    reaper_signal: Arc<ReaperSignal>,
}

#[derive(Default)]
struct ReaperSignal {
    stopped: Mutex<bool>,
    wake: Condvar,
}

impl ReaperSignal {
    /// Sleeps for `interval`; returns true once stopped.
    fn wait(&self, interval: Duration) -> bool {
        let mut stopped = self.stopped.lock();
        if !*stopped {
            self.wake.wait_for(&mut stopped, interval);
        }
        *stopped
    }

    fn stop(&self) {
        *self.stopped.lock() = true;
        self.wake.notify_all();
    }
}

/// Files a batch locks before it is admitted by the throttle.
#[derive(Debug, Clone)]
pub(crate) struct BatchLocks {
    kind: FileKind,
    mode: LockMode,
    ids: Vec<FsId>,
}

impl BatchLocks {
    fn new(kind: FileKind, mode: LockMode, ids: impl IntoIterator<Item = FsId>) -> Self {
        let mut ids: Vec<FsId> = ids.into_iter().collect();
        ids.sort();
        ids.dedup();
        Self { kind, mode, ids }
    }

    /// Shared locks for a read.
    pub(crate) fn shared(kind: FileKind, ids: impl IntoIterator<Item = FsId>) -> Self {
        Self::new(kind, LockMode::Shared, ids)
    }

    /// Exclusive locks for a write.
    pub(crate) fn exclusive(kind: FileKind, ids: impl IntoIterator<Item = FsId>) -> Self {
        Self::new(kind, LockMode::Exclusive, ids)
    }
}

/// Access to one transaction's files from inside a batch.
pub(crate) struct TxnScope<'a> {
    mgr: &'a TransactionManager,
    txn: &'a Transaction,
}

impl TxnScope<'_> {
    /// Runs `f` on the transaction's view of `id`, locking it in `mode`.
    pub(crate) fn file<R>(
        &self,
        kind: FileKind,
        id: &FsId,
        mode: LockMode,
        f: impl FnOnce(&mut FileContext, &FileIo<'_>) -> FsResult<R>,
    ) -> FsResult<R> {
        let key: LockKey = (kind, id.clone());
        self.mgr.lock(self.txn, &key, mode)?;
        let ctx = match self.txn.file(&key) {
            Some(ctx) => ctx,
            None => {
                let opened = FileContext::open(&self.mgr.store, kind, id.clone())?;
                self.txn.insert_file(key, opened)
            }
        };
        let io = FileIo {
            store: &self.mgr.store,
            journal: &self.txn.journal,
            gap_threshold: self.mgr.config.gap_threshold,
        };
        let mut ctx = ctx.lock();
        f(&mut ctx, &io)
    }
}

impl TransactionManager {
    /// Creates a manager over a recovered store.
    ///
    /// `recovered` holds the external transactions recovery completed
    /// heuristically.
    pub fn new(
        store: Arc<FileStore>,
        txlog: Arc<TxLogDir>,
        throttle: Throttle,
        stats: Arc<EngineStats>,
        config: EngineConfig,
        recovered: HashMap<Xid, HeuristicOutcome>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            txlog,
            locks: LockTable::new(),
            throttle,
            stats,
            config,
            active: RwLock::new(HashMap::new()),
            recovered: Mutex::new(recovered),
            timed_out: Mutex::new(HashSet::new()),
            shutting_down: AtomicBool::new(false),
            crash_point: Mutex::new(None),
            reaper: Mutex::new(None),
            reaper_signal: Arc::new(ReaperSignal::default()),
        })
    }

    /// Starts the thread that rolls back transactions past their deadline.
    pub fn start_reaper(self: &Arc<Self>) -> FsResult<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let signal = Arc::clone(&self.reaper_signal);
        let interval = self.config.reaper_interval;
        let handle = thread::Builder::new()
            .name("tsfs-reaper".into())
            .spawn(move || loop {
                if signal.wait(interval) {
                    break;
                }
                let Some(mgr) = weak.upgrade() else {
                    break;
                };
                mgr.reap_expired();
            })?;
        *self.reaper.lock() = Some(handle);
        Ok(())
    }

    /// Stops a commit at `point` with a simulated crash.
    #[cfg(feature = "fault-injection")]
    pub fn set_crash_point(&self, point: Option<CrashPoint>) {
        *self.crash_point.lock() = point;
    }

    fn check_crash_point(&self, point: CrashPoint) -> FsResult<()> {
        if *self.crash_point.lock() == Some(point) {
            warn!(?point, "simulated crash");
            return Err(StorageFault::SimulatedCrash(format!("{point:?}")));
        }
        Ok(())
    }

    /// Drops every transaction from memory without touching its logs,
    /// journal or files, leaving the disk as a crash at this moment would.
    /// Returns how many were dropped.
    #[cfg(feature = "fault-injection")]
    pub fn simulate_crash(&self) -> usize {
        let txns: Vec<Arc<Transaction>> = self.active.read().values().cloned().collect();
        for txn in &txns {
            self.abandon(txn);
        }
        warn!(abandoned = txns.len(), "simulated crash");
        txns.len()
    }

    fn abandon(&self, txn: &Transaction) {
        txn.files.lock().clear();
        drop(txn.journal.take());
        self.finish(txn);
    }

    /// A transaction stopped by a simulated crash is abandoned.
    fn abandon_on_crash(&self, txn: &Transaction, e: StorageFault) -> StorageFault {
        if matches!(e, StorageFault::SimulatedCrash(_)) {
            self.abandon(txn);
        }
        e
    }

    fn check_running(&self) -> FsResult<()> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(StorageFault::ShuttingDown);
        }
        Ok(())
    }

    /// Begins a local transaction.
    pub fn begin(&self) -> FsResult<Xid> {
        self.check_running()?;
        let xid = Xid::Local(TransactionId::new(self.txlog.next_id()?));
        self.register(xid.clone(), self.config.transaction_timeout);
        Ok(xid)
    }

    /// Starts a transaction branch chosen by an external coordinator.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` if the id is already active or recovered.
    pub fn start_external(&self, xid: GlobalXid, timeout: Option<Duration>) -> FsResult<Xid> {
        self.check_running()?;
        let xid = Xid::Global(xid);
        if self.active.read().contains_key(&xid) || self.recovered.lock().contains_key(&xid) {
            return Err(StorageFault::invalid_operation(format!(
                "{xid} is already known"
            )));
        }
        self.register(
            xid.clone(),
            timeout.unwrap_or(self.config.transaction_timeout),
        );
        Ok(xid)
    }

    fn register(&self, xid: Xid, timeout: Duration) {
        let txn = Arc::new(Transaction::new(
            xid.clone(),
            timeout,
            self.txlog.journal_path(&xid),
        ));
        self.active.write().insert(xid.clone(), txn);
        self.stats.record_transaction_start();
        debug!(%xid, ?timeout, "transaction started");
    }

    fn transaction(&self, xid: &Xid) -> FsResult<Arc<Transaction>> {
        if let Some(txn) = self.active.read().get(xid) {
            return Ok(Arc::clone(txn));
        }
        if self.timed_out.lock().contains(xid) {
            return Err(StorageFault::timeout(
                xid,
                "rolled back after its deadline",
            ));
        }
        Err(StorageFault::unknown_transaction(xid))
    }

    /// Moves the deadline of an active transaction to `timeout` from now.
    pub fn set_timeout(&self, xid: &Xid, timeout: Duration) -> FsResult<()> {
        self.transaction(xid)?.set_timeout(timeout);
        Ok(())
    }

    /// Returns true if the transaction has written nothing so far.
    pub fn is_read_only(&self, xid: &Xid) -> FsResult<bool> {
        Ok(self.transaction(xid)?.is_read_only())
    }

    /// Current state of a transaction.
    pub fn state(&self, xid: &Xid) -> FsResult<TransactionState> {
        if let Some(outcome) = self.recovered.lock().get(xid) {
            return Ok(TransactionState::Heuristic(*outcome));
        }
        Ok(*self.transaction(xid)?.phase.read())
    }

    fn lock(&self, txn: &Transaction, key: &LockKey, mode: LockMode) -> FsResult<()> {
        let remaining = txn.remaining();
        if remaining.is_zero() {
            return Err(StorageFault::timeout(&txn.xid, "transaction deadline passed"));
        }
        let timeout = self.config.lock_timeout.min(remaining);
        match self.locks.acquire(&txn.xid, key, mode, timeout) {
            Ok(acquired) => {
                if acquired == Acquired::AfterWait {
                    self.stats.record_lock_wait();
                }
                txn.held.lock().insert(key.clone());
                Ok(())
            }
            Err(e) => {
                warn!(xid = %txn.xid, fsid = %key.1, "lock wait timed out");
                Err(e)
            }
        }
    }

    /// Takes the locks of a batch in identifier order.
    fn lock_batch(&self, txn: &Transaction, locks: &BatchLocks) -> FsResult<()> {
        for id in &locks.ids {
            self.lock(txn, &(locks.kind, id.clone()), locks.mode)?;
        }
        Ok(())
    }

    fn permits(&self, items: usize, write: bool) -> FsResult<AcquiredPermits> {
        match (items, write) {
            (1, false) => self.throttle.acquire_read_permit(),
            (1, true) => self.throttle.acquire_write_permit(),
            _ => self.throttle.greedy_acquire(),
        }
    }

    /// Width for prepare and apply work. Not drawn from the throttle, so a
    /// decided commit never waits behind admitted batches.
    fn commit_permits(&self, items: usize) -> AcquiredPermits {
        AcquiredPermits::unbounded(items.min(self.config.executor_ceiling))
    }

    /// Runs `task` for every item in parallel inside transaction `xid`.
    ///
    /// Every lock in `locks` is granted before the batch takes its permits,
    /// so no permit is held while waiting on another transaction. A lock or
    /// deadline timeout rolls the transaction back. Running out of memory
    /// drops the index and file caches.
    pub(crate) fn run_batch<T, R, F>(
        &self,
        xid: &Xid,
        locks: BatchLocks,
        items: Vec<T>,
        task: F,
    ) -> FsResult<Vec<R>>
    where
        T: Send,
        R: Send,
        F: Fn(&TxnScope<'_>, T) -> FsResult<R> + Sync,
    {
        self.check_running()?;
        let txn = self.transaction(xid)?;
        let result = {
            let phase = txn.phase.read();
            txn.check_active(*phase)?;
            if txn.is_expired(Instant::now()) {
                Err(StorageFault::timeout(xid, "transaction deadline passed"))
            } else if items.is_empty() {
                Ok(Vec::new())
            } else {
                self.lock_batch(&txn, &locks).and_then(|()| {
                    let write = locks.mode == LockMode::Exclusive;
                    let permits = self.permits(items.len(), write)?;
                    let scope = TxnScope {
                        mgr: self,
                        txn: &txn,
                    };
                    BoundedExecutor::new(&permits, self.config.executor_ceiling)
                        .run(items, |item| task(&scope, item))
                })
            }
        };
        if let Err(e) = &result {
            self.stats.record_error();
            match e.class() {
                FaultClass::TransactionTimeout => self.expire(&txn),
                FaultClass::OutOfMemory => {
                    self.stats.record_out_of_memory();
                    self.store.invalidate_caches();
                    warn!(%xid, "out of memory, caches dropped");
                }
                _ => {}
            }
        }
        result
    }

    /// Releases a file the transaction only read.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` if the transaction modified the file.
    pub fn done_with_file(&self, xid: &Xid, kind: FileKind, id: &FsId) -> FsResult<()> {
        let txn = self.transaction(xid)?;
        let key: LockKey = (kind, id.clone());
        let mut files = txn.files.lock();
        if let Some(ctx) = files.get(&key) {
            if !ctx.lock().is_read_only() {
                return Err(StorageFault::invalid_operation(format!(
                    "{xid} modified {id}; it cannot be released early"
                )));
            }
            files.remove(&key);
        }
        drop(files);
        if txn.held.lock().remove(&key) {
            self.locks.release_all(xid, [&key]);
        }
        Ok(())
    }

    /// Prepares a transaction.
    ///
    /// Returns [`Vote::ReadOnly`] if nothing was written. An external
    /// read-only transaction is finished by its prepare.
    pub fn prepare(&self, xid: &Xid) -> FsResult<Vote> {
        let txn = self.transaction(xid)?;
        let mut phase = txn.phase.write();
        let vote = match *phase {
            TransactionState::Active => {
                if txn.is_expired(Instant::now()) {
                    drop(phase);
                    self.expire(&txn);
                    return Err(StorageFault::timeout(xid, "transaction deadline passed"));
                }
                self.prepare_locked(&txn, &mut phase)
                    .map_err(|e| self.abandon_on_crash(&txn, e))?
            }
            TransactionState::Prepared { read_only: true } => Vote::ReadOnly,
            TransactionState::Prepared { read_only: false } => Vote::Commit,
            other => {
                return Err(StorageFault::invalid_operation(format!(
                    "cannot prepare {xid} in state {other:?}"
                )))
            }
        };
        if vote == Vote::ReadOnly && xid.is_external() {
            *phase = TransactionState::Committed;
            self.finish(&txn);
            self.stats.record_transaction_commit();
        }
        Ok(vote)
    }

    fn prepare_locked(&self, txn: &Transaction, phase: &mut TransactionState) -> FsResult<Vote> {
        let contexts: Vec<_> = txn.files.lock().values().cloned().collect();
        let plans: Vec<FilePlan> = contexts.iter().filter_map(|c| c.lock().plan()).collect();
        if plans.is_empty() {
            *phase = TransactionState::Prepared { read_only: true };
            self.stats.record_read_only_prepare();
            debug!(xid = %txn.xid, "prepared read-only");
            return Ok(Vote::ReadOnly);
        }

        // Create every data file now so commit does not need new space.
        let creates: Vec<&FilePlan> = plans.iter().filter(|p| !p.deleted).collect();
        if !creates.is_empty() {
            let permits = self.commit_permits(creates.len());
            BoundedExecutor::new(&permits, self.config.executor_ceiling).run(creates, |plan| {
                self.store
                    .open_data(plan.kind, &plan.id, plan.file_id, true)
                    .map(|_| ())
            })?;
        }

        let journal = txn.journal.get_or_create()?;
        for plan in &plans {
            journal.append_plan(plan)?;
        }
        journal.sync()?;
        self.txlog.write(&StateLog {
            xid: txn.xid.clone(),
            state: LogState::Prepared,
            files: logged_files(&plans),
        })?;
        self.check_crash_point(CrashPoint::AfterPrepare)?;

        info!(xid = %txn.xid, files = plans.len(), "transaction prepared");
        *txn.plans.lock() = plans;
        *phase = TransactionState::Prepared { read_only: false };
        Ok(Vote::Commit)
    }

    /// Commits a transaction.
    ///
    /// An active transaction is prepared first when `one_phase` is set or
    /// when it is local. A failure after the commit decision is durable
    /// reports [`HeuristicOutcome::Hazard`]; recovery completes the commit
    /// at the next start.
    pub fn commit(&self, xid: &Xid, one_phase: bool) -> FsResult<()> {
        if let Some(outcome) = self.recovered.lock().get(xid).copied() {
            return match outcome {
                HeuristicOutcome::Committed => Ok(()),
                outcome => Err(StorageFault::Heuristic {
                    xid: xid.to_string(),
                    outcome,
                }),
            };
        }
        let txn = self.transaction(xid)?;
        let mut phase = txn.phase.write();
        match *phase {
            TransactionState::Active if one_phase || !xid.is_external() => {
                if txn.is_expired(Instant::now()) {
                    drop(phase);
                    self.expire(&txn);
                    return Err(StorageFault::timeout(xid, "transaction deadline passed"));
                }
                if let Err(e) = self.prepare_locked(&txn, &mut phase) {
                    if !matches!(e, StorageFault::SimulatedCrash(_)) {
                        if let Err(re) = self.rollback_locked(&txn, &mut phase) {
                            warn!(%xid, error = %re, "rollback after failed prepare failed");
                        }
                    }
                    return Err(self.abandon_on_crash(&txn, e));
                }
            }
            TransactionState::Active => {
                return Err(StorageFault::invalid_operation(format!(
                    "{xid} must be prepared before a two-phase commit"
                )))
            }
            TransactionState::Prepared { .. } => {}
            TransactionState::Heuristic(outcome) => {
                return Err(StorageFault::Heuristic {
                    xid: xid.to_string(),
                    outcome,
                })
            }
            other => {
                return Err(StorageFault::invalid_operation(format!(
                    "cannot commit {xid} in state {other:?}"
                )))
            }
        }

        if *phase == (TransactionState::Prepared { read_only: false }) {
            self.commit_locked(&txn, &mut phase)
                .map_err(|e| self.abandon_on_crash(&txn, e))?;
        }
        *phase = TransactionState::Committed;
        self.finish(&txn);
        self.stats.record_transaction_commit();
        debug!(%xid, "transaction committed");
        Ok(())
    }

    fn commit_locked(&self, txn: &Transaction, phase: &mut TransactionState) -> FsResult<()> {
        let plans = txn.plans.lock().clone();
        self.txlog.write(&StateLog {
            xid: txn.xid.clone(),
            state: LogState::Committing,
            files: logged_files(&plans),
        })?;
        self.check_crash_point(CrashPoint::AfterCommitLog)?;

        let journal = txn
            .journal
            .get()
            .ok_or_else(|| StorageFault::invalid_operation("prepared without a journal"));
        match journal.and_then(|j| self.apply_committed(&j, &plans)) {
            Ok(()) => {}
            Err(e @ StorageFault::SimulatedCrash(_)) => return Err(e),
            Err(e) => {
                error!(xid = %txn.xid, error = %e, "commit failed after the decision was logged");
                *phase = TransactionState::Heuristic(HeuristicOutcome::Hazard);
                return Err(StorageFault::Heuristic {
                    xid: txn.xid.to_string(),
                    outcome: HeuristicOutcome::Hazard,
                });
            }
        }
        txn.applied.store(true, Ordering::Release);
        drop(txn.journal.take());
        if let Err(e) = self.txlog.remove(&txn.xid) {
            // A leftover log would be replayed over later commits, so the
            // locks stay held until forget removes it.
            error!(xid = %txn.xid, error = %e, "committed log could not be removed");
            *phase = TransactionState::Heuristic(HeuristicOutcome::Hazard);
            return Err(StorageFault::Heuristic {
                xid: txn.xid.to_string(),
                outcome: HeuristicOutcome::Hazard,
            });
        }
        Ok(())
    }

    fn apply_committed(&self, journal: &Journal, plans: &[FilePlan]) -> FsResult<()> {
        let permits = self.commit_permits(plans.len());
        BoundedExecutor::new(&permits, self.config.executor_ceiling).run(
            plans.iter().collect(),
            |plan| apply_plan(&self.store, journal, plan, self.config.sync_on_commit),
        )?;
        drop(permits);
        for plan in plans {
            apply_plan_index(&self.store, plan)?;
        }
        self.store.flush_indexes()?;
        self.check_crash_point(CrashPoint::AfterApply)
    }

    /// Rolls back a transaction.
    pub fn rollback(&self, xid: &Xid) -> FsResult<()> {
        if let Some(outcome) = self.recovered.lock().get(xid).copied() {
            return match outcome {
                HeuristicOutcome::RolledBack => Ok(()),
                outcome => Err(StorageFault::Heuristic {
                    xid: xid.to_string(),
                    outcome,
                }),
            };
        }
        if self.timed_out.lock().remove(xid) {
            return Ok(());
        }
        let txn = self.transaction(xid)?;
        let mut phase = txn.phase.write();
        match *phase {
            TransactionState::Heuristic(outcome) => Err(StorageFault::Heuristic {
                xid: xid.to_string(),
                outcome,
            }),
            state if state.is_finished() => Err(StorageFault::unknown_transaction(xid)),
            _ => self.rollback_locked(&txn, &mut phase),
        }
    }

    fn rollback_locked(&self, txn: &Transaction, phase: &mut TransactionState) -> FsResult<()> {
        let contexts: Vec<_> = txn.files.lock().values().cloned().collect();
        let mut first_error = None;
        for ctx in contexts {
            let ctx = ctx.lock();
            if ctx.new_file {
                if let Some(file_id) = ctx.file_id {
                    if let Err(e) = self.store.delete_files(ctx.kind, &ctx.id, file_id) {
                        first_error.get_or_insert(e);
                    }
                }
                ctx.release_new_file(&self.store);
            }
        }
        drop(txn.journal.take());
        if let Err(e) = self.txlog.remove(&txn.xid) {
            first_error.get_or_insert(e);
        }
        *phase = TransactionState::RolledBack;
        self.finish(txn);
        self.stats.record_transaction_rollback();
        debug!(xid = %txn.xid, "transaction rolled back");
        first_error.map_or(Ok(()), Err)
    }

    /// Releases locks and forgets an in-memory transaction.
    fn finish(&self, txn: &Transaction) {
        let held: Vec<LockKey> = txn.held.lock().drain().collect();
        self.locks.release_all(&txn.xid, held.iter());
        self.active.write().remove(&txn.xid);
    }

    /// Rolls back an active transaction whose deadline or lock wait expired.
    fn expire(&self, txn: &Transaction) {
        let mut phase = txn.phase.write();
        if *phase != TransactionState::Active {
            return;
        }
        warn!(xid = %txn.xid, "rolling back timed out transaction");
        if let Err(e) = self.rollback_locked(txn, &mut phase) {
            error!(xid = %txn.xid, error = %e, "rollback of timed out transaction failed");
        }
        self.timed_out.lock().insert(txn.xid.clone());
        self.stats.record_transaction_timeout();
    }

    /// Rolls back every active transaction past its deadline.
    ///
    /// Prepared transactions wait for their coordinator. Transactions with
    /// an operation in flight are skipped until the next call.
    pub fn reap_expired(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<Arc<Transaction>> = self
            .active
            .read()
            .values()
            .filter(|t| t.is_expired(now))
            .cloned()
            .collect();
        let mut reaped = 0;
        for txn in expired {
            let Some(mut phase) = txn.phase.try_write() else {
                continue;
            };
            if *phase != TransactionState::Active {
                continue;
            }
            warn!(xid = %txn.xid, "transaction deadline passed");
            if let Err(e) = self.rollback_locked(&txn, &mut phase) {
                error!(xid = %txn.xid, error = %e, "rollback of expired transaction failed");
            }
            self.timed_out.lock().insert(txn.xid.clone());
            self.stats.record_transaction_timeout();
            reaped += 1;
        }
        reaped
    }

    /// Forgets a heuristically completed transaction.
    pub fn forget(&self, xid: &Xid) -> FsResult<()> {
        if self.recovered.lock().remove(xid).is_some() {
            self.txlog.remove(xid)?;
            info!(%xid, "forgot recovered transaction");
            return Ok(());
        }
        let txn = self.transaction(xid)?;
        let phase = txn.phase.write();
        match *phase {
            TransactionState::Heuristic(_) => {
                if txn.applied.load(Ordering::Acquire) {
                    self.txlog.remove(xid)?;
                }
                self.finish(&txn);
                info!(%xid, "forgot heuristic transaction");
                Ok(())
            }
            other => Err(StorageFault::invalid_operation(format!(
                "{xid} is {other:?}; only heuristic outcomes can be forgotten"
            ))),
        }
    }

    /// Forgets every recovered external transaction.
    pub fn forget_all_xa(&self) -> FsResult<usize> {
        let xids: Vec<Xid> = self.recovered.lock().keys().cloned().collect();
        for xid in &xids {
            self.forget(xid)?;
        }
        Ok(xids.len())
    }

    /// External transactions waiting for their coordinator: prepared ones
    /// and those completed heuristically during recovery.
    pub fn recover(&self) -> Vec<Xid> {
        let mut xids: Vec<Xid> = self.recovered.lock().keys().cloned().collect();
        for (xid, txn) in self.active.read().iter() {
            if xid.is_external()
                && matches!(*txn.phase.read(), TransactionState::Prepared { .. })
            {
                xids.push(xid.clone());
            }
        }
        xids.sort();
        xids
    }

    /// Active transactions and their states.
    pub fn active_transactions(&self) -> Vec<(Xid, TransactionState)> {
        let txns: Vec<Arc<Transaction>> = self.active.read().values().cloned().collect();
        let mut out: Vec<(Xid, TransactionState)> = txns
            .iter()
            .map(|t| (t.xid.clone(), *t.phase.read()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Recovered external transactions and their outcomes.
    pub fn recovered_transactions(&self) -> Vec<(Xid, HeuristicOutcome)> {
        let mut out: Vec<_> = self
            .recovered
            .lock()
            .iter()
            .map(|(x, o)| (x.clone(), *o))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// The throttle this manager draws permits from.
    pub fn throttle(&self) -> &Throttle {
        &self.throttle
    }

    /// Stops accepting work and rolls back active transactions.
    ///
    /// Prepared transactions keep their logs for recovery.
    pub fn shutdown(&self) -> FsResult<()> {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.reaper_signal.stop();
        if let Some(handle) = self.reaper.lock().take() {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
        self.throttle.close();
        let txns: Vec<Arc<Transaction>> = self.active.read().values().cloned().collect();
        for txn in txns {
            let mut phase = txn.phase.write();
            if *phase == TransactionState::Active {
                if let Err(e) = self.rollback_locked(&txn, &mut phase) {
                    warn!(xid = %txn.xid, error = %e, "rollback during shutdown failed");
                }
            }
        }
        self.store.flush_indexes()?;
        info!("transaction manager shut down");
        Ok(())
    }
}

impl Drop for TransactionManager {
    fn drop(&mut self) {
        self.reaper_signal.stop();
    }
}

fn logged_files(plans: &[FilePlan]) -> Vec<LoggedFile> {
    plans
        .iter()
        .map(|p| LoggedFile {
            kind: p.kind,
            id: p.id.clone(),
            new_file_id: p.new_file.then_some(p.file_id),
        })
        .collect()
}
