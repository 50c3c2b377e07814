//! Per-identifier lock table.
//!
//! Locks are keyed by `(kind, id)` and held until the owning transaction
//! finishes. The table is split into shards so unrelated identifiers do
//! not contend on one mutex.

use crate::error::{FsResult, StorageFault};
use crate::fsid::FsId;
use crate::types::{FileKind, Xid};
use parking_lot::{Condvar, Mutex};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::time::{Duration, Instant};
use tracing::debug;

const SHARDS: usize = 16;

/// Lock modes for read/write access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LockMode {
    /// Shared lock for reads (multiple readers allowed).
    Shared,
    /// Exclusive lock for writes (single writer, no readers).
    Exclusive,
}

/// Key of one lock.
pub type LockKey = (FileKind, FsId);

#[derive(Debug, Default)]
struct LockEntry {
    shared: Vec<Xid>,
    exclusive: Option<Xid>,
}

impl LockEntry {
    fn grantable(&self, owner: &Xid, mode: LockMode) -> bool {
        if let Some(holder) = &self.exclusive {
            return holder == owner;
        }
        match mode {
            LockMode::Shared => true,
            LockMode::Exclusive => self.shared.iter().all(|h| h == owner),
        }
    }

    fn holds(&self, owner: &Xid, mode: LockMode) -> bool {
        match mode {
            LockMode::Exclusive => self.exclusive.as_ref() == Some(owner),
            LockMode::Shared => {
                self.exclusive.as_ref() == Some(owner) || self.shared.contains(owner)
            }
        }
    }

    fn is_free(&self) -> bool {
        self.exclusive.is_none() && self.shared.is_empty()
    }
}

struct Shard {
    locks: Mutex<HashMap<LockKey, LockEntry>>,
    released: Condvar,
}

/// Result of a successful acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquired {
    /// The lock was already held in this or a stronger mode.
    AlreadyHeld,
    /// Granted without waiting.
    Immediate,
    /// Granted after waiting for other holders.
    AfterWait,
}

/// Sharded table of per-identifier locks.
pub struct LockTable {
    shards: Vec<Shard>,
}

impl Default for LockTable {
    fn default() -> Self {
        Self::new()
    }
}

impl LockTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self {
            shards: (0..SHARDS)
                .map(|_| Shard {
                    locks: Mutex::new(HashMap::new()),
                    released: Condvar::new(),
                })
                .collect(),
        }
    }

    fn shard(&self, key: &LockKey) -> &Shard {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[hasher.finish() as usize % SHARDS]
    }

    /// Acquires `key` in `mode` for `owner`, waiting at most `timeout`.
    ///
    /// A shared lock is upgraded in place once `owner` is its only holder.
    ///
    /// # Errors
    ///
    /// Returns `TransactionTimeout` if the lock could not be granted in time.
    pub fn acquire(
        &self,
        owner: &Xid,
        key: &LockKey,
        mode: LockMode,
        timeout: Duration,
    ) -> FsResult<Acquired> {
        let shard = self.shard(key);
        let deadline = Instant::now() + timeout;
        let mut locks = shard.locks.lock();
        let mut waited = false;
        loop {
            let entry = locks.entry(key.clone()).or_default();
            if entry.holds(owner, mode) {
                return Ok(Acquired::AlreadyHeld);
            }
            if entry.grantable(owner, mode) {
                match mode {
                    LockMode::Shared => entry.shared.push(owner.clone()),
                    LockMode::Exclusive => {
                        entry.shared.retain(|h| h != owner);
                        entry.exclusive = Some(owner.clone());
                    }
                }
                return Ok(if waited {
                    Acquired::AfterWait
                } else {
                    Acquired::Immediate
                });
            }
            if !waited {
                debug!(xid = %owner, fsid = %key.1, ?mode, "waiting for lock");
            }
            waited = true;
            if shard.released.wait_until(&mut locks, deadline).timed_out() {
                let entry = locks.entry(key.clone()).or_default();
                if entry.grantable(owner, mode) {
                    continue;
                }
                if entry.is_free() {
                    locks.remove(key);
                }
                return Err(StorageFault::timeout(
                    owner,
                    format!("lock on {} {} not granted within {timeout:?}", key.0, key.1),
                ));
            }
        }
    }

    /// Releases every lock in `keys` held by `owner`.
    pub fn release_all<'a>(&self, owner: &Xid, keys: impl IntoIterator<Item = &'a LockKey>) {
        for key in keys {
            let shard = self.shard(key);
            let mut locks = shard.locks.lock();
            if let Some(entry) = locks.get_mut(key) {
                if entry.exclusive.as_ref() == Some(owner) {
                    entry.exclusive = None;
                }
                entry.shared.retain(|h| h != owner);
                if entry.is_free() {
                    locks.remove(key);
                }
            }
            shard.released.notify_all();
        }
    }

    /// Returns the exclusive holder of `key`, if any.
    #[must_use]
    pub fn exclusive_holder(&self, key: &LockKey) -> Option<Xid> {
        self.shard(key)
            .locks
            .lock()
            .get(key)
            .and_then(|e| e.exclusive.clone())
    }

    /// Number of keys with at least one holder.
    #[must_use]
    pub fn locked_keys(&self) -> usize {
        self.shards.iter().map(|s| s.locks.lock().len()).sum()
    }
}
