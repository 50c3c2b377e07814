//! Two-phase commit across several transaction services.
//!
//! [`LocalCoordinator`] plays the part of an external transaction manager:
//! it starts one branch per resource, prepares them all and commits only
//! if every branch voted to. [`ScriptedResource`] is a resource whose votes
//! and failures are set by the test, recording every call it receives.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};
use tsfs_core::{FsResult, GlobalXid, StorageFault, TransactionId, TransactionService, Vote, Xid};

/// A call received by a [`ScriptedResource`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    /// `begin`
    Begin(Xid),
    /// `start_external`
    StartExternal(Xid),
    /// `prepare`
    Prepare(Xid),
    /// `commit`
    Commit(Xid, bool),
    /// `rollback`
    Rollback(Xid),
    /// `forget`
    Forget(Xid),
    /// `recover`
    Recover,
    /// `set_timeout`
    SetTimeout(Xid, Duration),
    /// `is_read_only`
    IsReadOnly(Xid),
}

/// What a [`ScriptedResource`] answers to `prepare`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrepareScript {
    /// Vote with this value.
    Vote(Vote),
    /// Fail the prepare.
    Fail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BranchState {
    Active,
    Prepared,
}

/// A transaction service driven by a script.
pub struct ScriptedResource {
    name: String,
    prepare: Mutex<PrepareScript>,
    fail_commit: Mutex<bool>,
    next_id: AtomicU64,
    branches: Mutex<HashMap<Xid, BranchState>>,
    calls: Mutex<Vec<Call>>,
}

impl ScriptedResource {
    /// Creates a resource that votes [`Vote::Commit`].
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            prepare: Mutex::new(PrepareScript::Vote(Vote::Commit)),
            fail_commit: Mutex::new(false),
            next_id: AtomicU64::new(1),
            branches: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Sets the answer to later prepares.
    pub fn on_prepare(&self, script: PrepareScript) -> &Self {
        *self.prepare.lock() = script;
        self
    }

    /// Makes later commits fail.
    pub fn fail_commits(&self, fail: bool) -> &Self {
        *self.fail_commit.lock() = fail;
        self
    }

    /// Calls received so far.
    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    /// Branches that are started but not finished.
    pub fn open_branches(&self) -> usize {
        self.branches.lock().len()
    }

    fn record(&self, call: Call) {
        debug!(resource = %self.name, ?call, "scripted call");
        self.calls.lock().push(call);
    }

    fn branch(&self, xid: &Xid) -> FsResult<BranchState> {
        self.branches
            .lock()
            .get(xid)
            .copied()
            .ok_or_else(|| StorageFault::unknown_transaction(xid))
    }
}

impl TransactionService for ScriptedResource {
    fn begin(&self) -> FsResult<Xid> {
        let xid = Xid::Local(TransactionId::new(
            self.next_id.fetch_add(1, Ordering::Relaxed),
        ));
        self.record(Call::Begin(xid.clone()));
        self.branches.lock().insert(xid.clone(), BranchState::Active);
        Ok(xid)
    }

    fn start_external(&self, xid: GlobalXid, _timeout: Option<Duration>) -> FsResult<Xid> {
        let xid = Xid::Global(xid);
        self.record(Call::StartExternal(xid.clone()));
        let mut branches = self.branches.lock();
        if branches.contains_key(&xid) {
            return Err(StorageFault::invalid_operation(format!("{xid} is already known")));
        }
        branches.insert(xid.clone(), BranchState::Active);
        Ok(xid)
    }

    fn prepare(&self, xid: &Xid) -> FsResult<Vote> {
        self.record(Call::Prepare(xid.clone()));
        self.branch(xid)?;
        match *self.prepare.lock() {
            PrepareScript::Fail => Err(StorageFault::invalid_operation(format!(
                "{}: scripted prepare failure",
                self.name
            ))),
            PrepareScript::Vote(Vote::ReadOnly) => {
                self.branches.lock().remove(xid);
                Ok(Vote::ReadOnly)
            }
            PrepareScript::Vote(vote) => {
                self.branches.lock().insert(xid.clone(), BranchState::Prepared);
                Ok(vote)
            }
        }
    }

    fn commit(&self, xid: &Xid, one_phase: bool) -> FsResult<()> {
        self.record(Call::Commit(xid.clone(), one_phase));
        let state = self.branch(xid)?;
        if state == BranchState::Active && !one_phase && xid.is_external() {
            return Err(StorageFault::invalid_operation(format!(
                "{xid} must be prepared before a two-phase commit"
            )));
        }
        if *self.fail_commit.lock() {
            return Err(StorageFault::Heuristic {
                xid: xid.to_string(),
                outcome: tsfs_core::HeuristicOutcome::Hazard,
            });
        }
        self.branches.lock().remove(xid);
        Ok(())
    }

    fn rollback(&self, xid: &Xid) -> FsResult<()> {
        self.record(Call::Rollback(xid.clone()));
        self.branch(xid)?;
        self.branches.lock().remove(xid);
        Ok(())
    }

    fn forget(&self, xid: &Xid) -> FsResult<()> {
        self.record(Call::Forget(xid.clone()));
        Ok(())
    }

    fn recover(&self) -> FsResult<Vec<Xid>> {
        self.record(Call::Recover);
        let mut prepared: Vec<Xid> = self
            .branches
            .lock()
            .iter()
            .filter(|(x, s)| x.is_external() && **s == BranchState::Prepared)
            .map(|(x, _)| x.clone())
            .collect();
        prepared.sort();
        Ok(prepared)
    }

    fn set_timeout(&self, xid: &Xid, timeout: Duration) -> FsResult<()> {
        self.record(Call::SetTimeout(xid.clone(), timeout));
        self.branch(xid).map(|_| ())
    }

    fn is_read_only(&self, xid: &Xid) -> FsResult<bool> {
        self.record(Call::IsReadOnly(xid.clone()));
        self.branch(xid)?;
        Ok(*self.prepare.lock() == PrepareScript::Vote(Vote::ReadOnly))
    }
}

/// How a coordinated transaction ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Every branch committed or voted read-only.
    Committed,
    /// Every branch was rolled back; the first failure is kept.
    RolledBack(String),
}

/// A coordinator running two-phase commit over several services.
pub struct LocalCoordinator {
    format_id: i32,
    next_global: AtomicU64,
}

impl LocalCoordinator {
    /// Creates a coordinator that tags its ids with `format_id`.
    pub fn new(format_id: i32) -> Self {
        Self {
            format_id,
            next_global: AtomicU64::new(1),
        }
    }

    /// Id of branch `branch` of global transaction `global`.
    pub fn global_xid(&self, global: u64, branch: usize) -> GlobalXid {
        GlobalXid::new(
            self.format_id,
            &global.to_be_bytes(),
            &(branch as u32).to_be_bytes(),
        )
    }

    /// Starts a branch on every resource, runs `work` with the branch ids
    /// and completes the transaction.
    ///
    /// Work or prepare failures roll back every branch still open. A
    /// commit failure after all votes were in is returned as an error:
    /// the outcome is then up to the resources' recovery.
    pub fn run<F>(&self, resources: &[&dyn TransactionService], work: F) -> FsResult<Outcome>
    where
        F: FnOnce(&[Xid]) -> FsResult<()>,
    {
        let global = self.next_global.fetch_add(1, Ordering::Relaxed);
        let mut xids = Vec::with_capacity(resources.len());
        for (branch, resource) in resources.iter().enumerate() {
            match resource.start_external(self.global_xid(global, branch), None) {
                Ok(xid) => xids.push(xid),
                Err(e) => {
                    roll_back(&resources[..xids.len()], &xids);
                    return Ok(Outcome::RolledBack(e.to_string()));
                }
            }
        }

        if let Err(e) = work(&xids) {
            roll_back(resources, &xids);
            return Ok(Outcome::RolledBack(e.to_string()));
        }

        let mut to_commit = Vec::new();
        for (i, (resource, xid)) in resources.iter().zip(&xids).enumerate() {
            match resource.prepare(xid) {
                Ok(Vote::Commit) => to_commit.push(i),
                Ok(Vote::ReadOnly) => {}
                Err(e) => {
                    warn!(%xid, error = %e, "branch failed to prepare");
                    // Read-only voters are already finished.
                    let open = to_commit.iter().copied().chain(i..xids.len());
                    for j in open.collect::<Vec<_>>() {
                        let _ = resources[j].rollback(&xids[j]);
                    }
                    return Ok(Outcome::RolledBack(e.to_string()));
                }
            }
        }

        for i in to_commit {
            resources[i].commit(&xids[i], false)?;
        }
        Ok(Outcome::Committed)
    }
}

fn roll_back(resources: &[&dyn TransactionService], xids: &[Xid]) {
    for (resource, xid) in resources.iter().zip(xids) {
        if let Err(e) = resource.rollback(xid) {
            warn!(%xid, error = %e, "branch rollback failed");
        }
    }
}
