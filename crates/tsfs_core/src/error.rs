//! Error types for the tsfs engine.

use crate::fsid::FsId;
use crate::types::{DataType, HeuristicOutcome};
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for engine operations.
pub type FsResult<T> = Result<T, StorageFault>;

/// Coarse classification of a [`StorageFault`].
///
/// Callers match on the class to decide between retrying, rolling back,
/// reporting to the client or giving up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultClass {
    /// The identifier has no data.
    NotFound,
    /// The stored element type disagrees with the requested one.
    TypeMismatch,
    /// A lock wait or the transaction deadline expired.
    TransactionTimeout,
    /// Disk I/O failure, corruption or allocator exhaustion.
    Structural,
    /// Invalid arguments or API misuse.
    Programming,
    /// An allocation could not be satisfied.
    OutOfMemory,
    /// A recovered transaction was completed differently than requested.
    Heuristic,
}

/// Errors raised by the engine.
#[derive(Debug, Error)]
pub enum StorageFault {
    /// Byte store error.
    #[error("storage error: {0}")]
    Storage(#[from] tsfs_storage::StorageError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The identifier does not exist.
    #[error("{id} does not exist")]
    NotFound {
        /// Identifier that was looked up.
        id: FsId,
    },

    /// A read expected a different element type.
    #[error("{id} holds {found} data, {expected} was requested")]
    TypeMismatch {
        /// Identifier that was read.
        id: FsId,
        /// Type requested by the caller.
        expected: DataType,
        /// Type found in the metadata.
        found: DataType,
    },

    /// A lock wait or a transaction deadline was exceeded.
    #[error("transaction {xid} timed out: {reason}")]
    TransactionTimeout {
        /// Transaction that timed out.
        xid: String,
        /// What the transaction was waiting for.
        reason: String,
    },

    /// On-disk structure is damaged.
    #[error("corruption: {message}")]
    Corrupted {
        /// Description of the damage.
        message: String,
    },

    /// Checksum mismatch on a page or journal record.
    #[error("checksum mismatch: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch {
        /// Stored checksum.
        expected: u32,
        /// Computed checksum.
        actual: u32,
    },

    /// No free blocks remain in an allocator.
    #[error("allocator exhausted after {capacity} blocks")]
    AllocatorExhausted {
        /// Number of blocks the allocator manages.
        capacity: u64,
    },

    /// An interval has inverted or negative bounds.
    #[error("invalid interval [{start}, {end}]")]
    InvalidInterval {
        /// Interval start.
        start: i64,
        /// Interval end.
        end: i64,
    },

    /// The identifier string is malformed.
    #[error("invalid identifier {value:?}: {reason}")]
    InvalidId {
        /// The rejected string.
        value: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The transaction id was never begun or is already finished.
    #[error("unknown transaction {xid}")]
    UnknownTransaction {
        /// The offending transaction id.
        xid: String,
    },

    /// Operation not permitted in the current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why the operation is invalid.
        message: String,
    },

    /// A recovered transaction was completed heuristically.
    #[error("transaction {xid} was heuristically completed: {outcome}")]
    Heuristic {
        /// Transaction id.
        xid: String,
        /// How it was completed.
        outcome: HeuristicOutcome,
    },

    /// A buffer allocation failed.
    #[error("out of memory allocating {requested} bytes")]
    OutOfMemory {
        /// Bytes that were requested.
        requested: usize,
    },

    /// Another process holds the store lock.
    #[error("store at {path} is locked by another process")]
    StoreLocked {
        /// Root of the locked store.
        path: PathBuf,
    },

    /// Invalid or unsupported on-disk format.
    #[error("invalid format: {message}")]
    InvalidFormat {
        /// Description of the format issue.
        message: String,
    },

    /// Startup recovery could not restore a consistent state.
    #[error("recovery failed: {message}")]
    Recovery {
        /// Description of the failure.
        message: String,
    },

    /// The query string could not be parsed.
    #[error("bad query {query:?}: {message}")]
    Query {
        /// The query text.
        query: String,
        /// Parse failure.
        message: String,
    },

    /// Destructive cleanup is disabled by configuration.
    #[error("file store cleanup is not allowed by configuration")]
    CleanupDisabled,

    /// The engine is shutting down.
    #[error("engine is shutting down")]
    ShuttingDown,

    /// A commit was stopped at an injected crash point.
    #[error("simulated crash at {0}")]
    SimulatedCrash(String),
}

impl StorageFault {
    /// Creates a not-found error.
    pub fn not_found(id: &FsId) -> Self {
        Self::NotFound { id: id.clone() }
    }

    /// Creates a transaction timeout error.
    pub fn timeout(xid: impl ToString, reason: impl Into<String>) -> Self {
        Self::TransactionTimeout {
            xid: xid.to_string(),
            reason: reason.into(),
        }
    }

    /// Creates a corruption error.
    pub fn corrupted(message: impl Into<String>) -> Self {
        Self::Corrupted {
            message: message.into(),
        }
    }

    /// Creates an unknown transaction error.
    pub fn unknown_transaction(xid: impl ToString) -> Self {
        Self::UnknownTransaction {
            xid: xid.to_string(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Creates an invalid format error.
    pub fn invalid_format(message: impl Into<String>) -> Self {
        Self::InvalidFormat {
            message: message.into(),
        }
    }

    /// Creates a recovery error.
    pub fn recovery(message: impl Into<String>) -> Self {
        Self::Recovery {
            message: message.into(),
        }
    }

    /// Returns the class of this fault.
    #[must_use]
    pub fn class(&self) -> FaultClass {
        match self {
            Self::NotFound { .. } => FaultClass::NotFound,
            Self::TypeMismatch { .. } => FaultClass::TypeMismatch,
            Self::TransactionTimeout { .. } => FaultClass::TransactionTimeout,
            Self::OutOfMemory { .. } => FaultClass::OutOfMemory,
            Self::Heuristic { .. } => FaultClass::Heuristic,
            Self::InvalidInterval { .. }
            | Self::InvalidId { .. }
            | Self::UnknownTransaction { .. }
            | Self::InvalidOperation { .. }
            | Self::Query { .. }
            | Self::CleanupDisabled => FaultClass::Programming,
            Self::Storage(_)
            | Self::Io(_)
            | Self::Corrupted { .. }
            | Self::ChecksumMismatch { .. }
            | Self::AllocatorExhausted { .. }
            | Self::StoreLocked { .. }
            | Self::InvalidFormat { .. }
            | Self::Recovery { .. }
            | Self::ShuttingDown
            | Self::SimulatedCrash(_) => FaultClass::Structural,
        }
    }

    /// Returns true for allocation failures.
    #[must_use]
    pub fn is_out_of_memory(&self) -> bool {
        self.class() == FaultClass::OutOfMemory
    }
}

/// Reserves a zero-filled buffer, reporting allocation failure as a fault.
pub(crate) fn try_alloc_buffer(len: usize, fill: u8) -> FsResult<Vec<u8>> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(len)
        .map_err(|_| StorageFault::OutOfMemory { requested: len })?;
    buf.resize(len, fill);
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classes() {
        let id = FsId::new("/a/b").unwrap();
        assert_eq!(StorageFault::not_found(&id).class(), FaultClass::NotFound);
        assert_eq!(
            StorageFault::timeout("local:1", "lock").class(),
            FaultClass::TransactionTimeout
        );
        assert_eq!(
            StorageFault::InvalidInterval { start: 5, end: 1 }.class(),
            FaultClass::Programming
        );
        assert_eq!(StorageFault::corrupted("x").class(), FaultClass::Structural);
        assert!(StorageFault::OutOfMemory { requested: 1 }.is_out_of_memory());
    }

    #[test]
    fn not_found_message_names_id() {
        let id = FsId::new("/pa/flux/42").unwrap();
        assert_eq!(
            StorageFault::not_found(&id).to_string(),
            "/pa/flux/42 does not exist"
        );
    }

    #[test]
    fn alloc_buffer_fills() {
        let buf = try_alloc_buffer(8, 0xAA).unwrap();
        assert_eq!(buf, vec![0xAA; 8]);
    }
}
