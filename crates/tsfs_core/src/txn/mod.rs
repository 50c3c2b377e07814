//! Transactions: journals, state logs, per-identifier locks and the
//! manager that ties them together.

pub(crate) mod executor;
pub mod journal;
pub mod lock;
pub mod log;
mod manager;
mod state;

pub use executor::BoundedExecutor;
pub use journal::{FilePlan, Journal, JournalScan, PlanWrite};
pub use lock::{LockKey, LockMode, LockTable};
pub use log::{LogState, LoggedFile, StateLog, TxLogDir, TxLogEntries};
pub use manager::{CrashPoint, TransactionManager};
pub(crate) use manager::{BatchLocks, TxnScope};
pub use state::TransactionState;
