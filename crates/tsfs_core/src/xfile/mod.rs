//! Transactional views of data files.
//!
//! A [`FileContext`] is one identifier as seen by one transaction. Reads
//! combine the committed data file with the bytes the transaction has
//! journaled; writes only append to the journal and update the in-memory
//! metadata. Nothing reaches the data file until a commit applies the
//! context's [`FilePlan`].
//!
//! - `random`: fixed-width time series with interval merging
//! - `stream`: blobs
//! - `mjd`: MJD keyed point series
//! - `plan`: applying committed plans to the store

mod mjd;
mod plan;
mod random;
mod stream;

pub(crate) use plan::{apply_plan, apply_plan_index};
pub use random::CadenceIntervals;

use crate::error::{FsResult, StorageFault};
use crate::fsid::FsId;
use crate::metadata::StoredMetadata;
use crate::store::FileStore;
use crate::txn::journal::{FilePlan, Journal, PlanWrite};
use crate::types::FileKind;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use tsfs_storage::StorageBackend;

/// Journal of a transaction, created on first write.
pub(crate) struct JournalSlot {
    path: PathBuf,
    journal: Mutex<Option<Arc<Journal>>>,
}

impl JournalSlot {
    pub(crate) fn new(path: PathBuf) -> Self {
        Self {
            path,
            journal: Mutex::new(None),
        }
    }

    pub(crate) fn get(&self) -> Option<Arc<Journal>> {
        self.journal.lock().clone()
    }

    pub(crate) fn get_or_create(&self) -> FsResult<Arc<Journal>> {
        let mut slot = self.journal.lock();
        if let Some(journal) = slot.as_ref() {
            return Ok(Arc::clone(journal));
        }
        let journal = Arc::new(Journal::open(&self.path)?);
        *slot = Some(Arc::clone(&journal));
        Ok(journal)
    }

    /// Closes the journal, returning it if it was ever opened.
    pub(crate) fn take(&self) -> Option<Arc<Journal>> {
        self.journal.lock().take()
    }

    pub(crate) fn path(&self) -> &std::path::Path {
        &self.path
    }
}

/// Everything a file operation needs besides its context.
pub(crate) struct FileIo<'a> {
    pub store: &'a FileStore,
    pub journal: &'a JournalSlot,
    pub gap_threshold: u64,
}

/// One identifier inside one transaction.
#[derive(Debug)]
pub(crate) struct FileContext {
    pub kind: FileKind,
    pub id: FsId,
    /// Data file id, existing or allocated by this transaction.
    pub file_id: Option<u64>,
    /// The identifier was mapped when the context was opened.
    pub existed: bool,
    /// `file_id` was allocated by this transaction.
    pub new_file: bool,
    /// Current metadata. `None` when the identifier does not exist.
    pub meta: Option<StoredMetadata>,
    pub writes: Vec<PlanWrite>,
    /// Committed content is ignored and replaced.
    pub truncate: bool,
    pub deleted: bool,
    pub dirty: bool,
}

impl FileContext {
    /// Opens the committed state of `id`.
    pub(crate) fn open(store: &FileStore, kind: FileKind, id: FsId) -> FsResult<Self> {
        let file_id = store.lookup(kind, &id)?;
        let meta = match file_id {
            Some(file_id) => {
                let meta = store.read_metadata(kind, &id, file_id)?.ok_or_else(|| {
                    StorageFault::corrupted(format!("{id} is indexed but has no metadata"))
                })?;
                if meta.kind() != kind {
                    return Err(StorageFault::corrupted(format!(
                        "{id} metadata is {} but the {kind} index maps it",
                        meta.kind()
                    )));
                }
                Some(meta)
            }
            None => None,
        };
        Ok(Self {
            kind,
            id,
            file_id,
            existed: file_id.is_some(),
            new_file: false,
            meta,
            writes: Vec::new(),
            truncate: false,
            deleted: false,
            dirty: false,
        })
    }

    /// Returns true if the identifier exists in this transaction's view.
    pub(crate) fn exists(&self) -> bool {
        self.meta.is_some()
    }

    /// Makes sure a data file id is assigned, allocating one if needed.
    pub(crate) fn ensure_file_id(&mut self, store: &FileStore) -> FsResult<u64> {
        if let Some(file_id) = self.file_id {
            return Ok(file_id);
        }
        let file_id = store.allocate_file_id(self.kind)?;
        self.file_id = Some(file_id);
        self.new_file = true;
        Ok(file_id)
    }

    /// Discards everything, committed or journaled, ahead of a rewrite.
    pub(crate) fn begin_rewrite(&mut self) {
        self.writes.clear();
        self.truncate = true;
        self.deleted = false;
        self.dirty = true;
    }

    /// Marks the identifier deleted.
    pub(crate) fn delete(&mut self) -> bool {
        if self.meta.is_none() {
            return false;
        }
        self.meta = None;
        self.writes.clear();
        self.deleted = true;
        self.dirty = true;
        true
    }

    /// Journals `bytes` for `offset` of the data file.
    pub(crate) fn journal_write(
        &mut self,
        io: &FileIo<'_>,
        offset: u64,
        bytes: &[u8],
    ) -> FsResult<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        let journal = io.journal.get_or_create()?;
        let journal_offset = journal.append_data(bytes)?;
        self.writes.push(PlanWrite {
            file_offset: offset,
            journal_offset,
            len: bytes.len() as u64,
        });
        self.dirty = true;
        Ok(())
    }

    /// Fills `buf` with the transaction's view of `offset..offset+len`.
    ///
    /// Bytes never written read as whatever `buf` held.
    pub(crate) fn read_bytes(&self, io: &FileIo<'_>, offset: u64, buf: &mut [u8]) -> FsResult<()> {
        let end = offset + buf.len() as u64;
        if self.existed && !self.truncate && !self.deleted {
            if let Some(file_id) = self.file_id {
                if let Some(data) = io.store.open_data(self.kind, &self.id, file_id, false)? {
                    let size = data.size()?;
                    if offset < size {
                        let n = (size.min(end) - offset) as usize;
                        data.read_into(offset, &mut buf[..n])?;
                    }
                }
            }
        }
        if self.writes.is_empty() {
            return Ok(());
        }
        let journal = io
            .journal
            .get()
            .ok_or_else(|| StorageFault::invalid_operation("journaled writes without a journal"))?;
        for w in &self.writes {
            let start = offset.max(w.file_offset);
            let stop = end.min(w.file_end());
            if start >= stop {
                continue;
            }
            let dst = &mut buf[(start - offset) as usize..(stop - offset) as usize];
            journal.read_into(w.journal_offset + (start - w.file_offset), dst)?;
        }
        Ok(())
    }

    /// Plan committing this context, if it changed anything durable.
    pub(crate) fn plan(&self) -> Option<FilePlan> {
        if !self.dirty {
            return None;
        }
        let file_id = self.file_id?;
        if self.deleted && !self.existed {
            return None;
        }
        Some(FilePlan {
            kind: self.kind,
            id: self.id.clone(),
            file_id,
            new_file: self.new_file,
            truncate: self.truncate,
            deleted: self.deleted,
            writes: self.writes.clone(),
            metadata: self.meta.clone(),
        })
    }

    /// Returns the allocated id of a new file that will not be committed.
    pub(crate) fn release_new_file(&self, store: &FileStore) {
        if self.new_file {
            if let Some(file_id) = self.file_id {
                store.release_file_id(self.kind, file_id);
            }
        }
    }

    /// Returns true if the transaction changed nothing here.
    pub(crate) fn is_read_only(&self) -> bool {
        !self.dirty
    }
}
