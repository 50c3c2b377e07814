//! Transaction state.

use crate::error::{FsResult, StorageFault};
use crate::txn::journal::FilePlan;
use crate::txn::lock::LockKey;
use crate::types::{HeuristicOutcome, Xid};
use crate::xfile::{FileContext, JournalSlot};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// State of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Transaction is active and can perform operations.
    Active,
    /// Prepared; only commit or rollback may follow.
    Prepared {
        /// Nothing was written.
        read_only: bool,
    },
    /// Transaction has been committed.
    Committed,
    /// Transaction has been rolled back.
    RolledBack,
    /// Completed without its coordinator's decision.
    Heuristic(HeuristicOutcome),
}

impl TransactionState {
    /// Returns true once no further operation is possible.
    #[must_use]
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Committed | Self::RolledBack | Self::Heuristic(_))
    }
}

/// A transaction known to the manager.
///
/// Data operations hold the phase lock shared; prepare, commit and rollback
/// hold it exclusively, so a transaction never finishes under a running
/// operation.
pub(crate) struct Transaction {
    pub xid: Xid,
    pub phase: RwLock<TransactionState>,
    deadline: Mutex<Instant>,
    pub files: Mutex<HashMap<LockKey, Arc<Mutex<FileContext>>>>,
    pub held: Mutex<HashSet<LockKey>>,
    /// Plans fixed by prepare.
    pub plans: Mutex<Vec<FilePlan>>,
    pub journal: JournalSlot,
    /// Every plan reached its files; only the log is left to remove.
    pub applied: AtomicBool,
}

impl Transaction {
    pub(crate) fn new(xid: Xid, timeout: Duration, journal_path: PathBuf) -> Self {
        Self {
            xid,
            phase: RwLock::new(TransactionState::Active),
            deadline: Mutex::new(deadline_after(timeout)),
            files: Mutex::new(HashMap::new()),
            held: Mutex::new(HashSet::new()),
            plans: Mutex::new(Vec::new()),
            journal: JournalSlot::new(journal_path),
            applied: AtomicBool::new(false),
        }
    }

    pub(crate) fn set_timeout(&self, timeout: Duration) {
        *self.deadline.lock() = deadline_after(timeout);
    }

    pub(crate) fn deadline(&self) -> Instant {
        *self.deadline.lock()
    }

    pub(crate) fn remaining(&self) -> Duration {
        self.deadline().saturating_duration_since(Instant::now())
    }

    pub(crate) fn is_expired(&self, now: Instant) -> bool {
        now >= self.deadline()
    }

    /// Fails unless the transaction still accepts data operations.
    pub(crate) fn check_active(&self, state: TransactionState) -> FsResult<()> {
        match state {
            TransactionState::Active => Ok(()),
            other => Err(StorageFault::invalid_operation(format!(
                "{} is {other:?}, not active",
                self.xid
            ))),
        }
    }

    /// Context of `key`, if the transaction touched it.
    pub(crate) fn file(&self, key: &LockKey) -> Option<Arc<Mutex<FileContext>>> {
        self.files.lock().get(key).cloned()
    }

    pub(crate) fn insert_file(&self, key: LockKey, ctx: FileContext) -> Arc<Mutex<FileContext>> {
        Arc::clone(
            self.files
                .lock()
                .entry(key)
                .or_insert_with(|| Arc::new(Mutex::new(ctx))),
        )
    }

    /// Returns true if no touched file was modified.
    pub(crate) fn is_read_only(&self) -> bool {
        self.files.lock().values().all(|f| f.lock().is_read_only())
    }
}

fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout)
        .unwrap_or_else(|| now + Duration::from_secs(86_400 * 365))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TransactionId;

    #[test]
    fn deadlines_move_with_set_timeout() {
        let txn = Transaction::new(
            Xid::Local(TransactionId::new(1)),
            Duration::from_secs(0),
            PathBuf::from("unused.journal"),
        );
        assert!(txn.is_expired(Instant::now()));
        txn.set_timeout(Duration::from_secs(60));
        assert!(!txn.is_expired(Instant::now()));
        assert!(txn.remaining() > Duration::from_secs(50));
        assert!(txn.is_read_only());
    }

    #[test]
    fn huge_timeouts_do_not_overflow() {
        let txn = Transaction::new(
            Xid::Local(TransactionId::new(2)),
            Duration::MAX,
            PathBuf::from("unused.journal"),
        );
        assert!(!txn.is_expired(Instant::now()));
    }

    #[test]
    fn only_active_accepts_operations() {
        let txn = Transaction::new(
            Xid::Local(TransactionId::new(3)),
            Duration::from_secs(1),
            PathBuf::from("unused.journal"),
        );
        assert!(txn.check_active(TransactionState::Active).is_ok());
        assert!(txn
            .check_active(TransactionState::Prepared { read_only: false })
            .is_err());
        assert!(TransactionState::Committed.is_finished());
    }
}
