//! # tsfs core
//!
//! Transactional store for time series, blobs and MJD point series.
//!
//! This crate provides:
//! - [`FsId`] identifiers and interval sets for valid and origin ranges
//! - A disk-backed B-link tree mapping identifiers to data files
//! - Transactional random-access and stream files with overwrite and
//!   merge writes
//! - A transaction manager with local and two-phase external transactions,
//!   per-identifier locks, deadlines and crash recovery
//! - A permit throttle and a locality scheduler bounding concurrent I/O
//! - The [`FileStoreBackend`] façade used by servers and tools

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod alloc;
mod backend;
pub mod blink;
mod carrier;
mod codec;
mod config;
mod dir;
mod engine;
mod error;
mod fsid;
mod interval;
mod merge;
mod metadata;
mod query;
pub mod recovery;
mod scheduler;
mod stats;
mod store;
mod throttle;
pub mod txn;
mod types;
mod xfile;

pub use alloc::BlockAllocator;
pub use backend::{
    ExistsPolicy, FileStoreBackend, StatusReport, TransactionService, TransactionStatus,
    TransactionalBackend,
};
pub use carrier::{
    BlobCarrier, MjdPoint, MjdTimeSeries, TimeSeriesCarrier, MAX_CADENCE, MJD_POINT_SIZE,
};
pub use codec::{compute_crc32, ByteReader};
pub use config::EngineConfig;
pub use dir::{EngineDir, FsRootEntry, FsRoots};
pub use engine::Engine;
pub use error::{FaultClass, FsResult, StorageFault};
pub use fsid::{FsId, FsIdInterner, MAX_FSID_LEN};
pub use interval::{Interval, IntervalSet, SimpleInterval, TaggedInterval};
pub use merge::{Bridge, IoChunk, TimeSeriesIntervalIterator, TimeSeriesMergeIntervalIterator};
pub use metadata::{FileMetadata, StoredMetadata};
pub use query::{parent_paths, FsQuery};
pub use recovery::{check_store, recover_store, CheckReport, Problem, RecoveryReport};
pub use scheduler::{reassemble, LocationFactory, Scheduled, Scheduler};
pub use stats::{EngineStats, StatsSnapshot};
pub use store::{DirectoryHash, FileStore, Location};
pub use throttle::{AcquiredPermits, Throttle};
pub use txn::{CrashPoint, TransactionManager, TransactionState, TxLogDir};
pub use types::{
    DataType, FileKind, GlobalXid, HeuristicOutcome, TransactionId, Vote, Xid,
    LOCAL_LOG_EXTENSION, XA_LOG_EXTENSION,
};
pub use xfile::CadenceIntervals;

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
