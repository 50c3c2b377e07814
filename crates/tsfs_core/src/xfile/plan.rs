//! Applying committed file plans.
//!
//! Both commit and recovery go through these functions, so a plan that is
//! applied again after a crash lands on the same final state.

use crate::error::{FsResult, StorageFault};
use crate::store::FileStore;
use crate::txn::journal::{FilePlan, Journal};
use tracing::debug;
use tsfs_storage::StorageBackend;

/// Largest piece copied from the journal in one step.
const COPY_CHUNK: u64 = 1 << 20;

/// Brings the data and metadata files to the state described by `plan`.
pub(crate) fn apply_plan(
    store: &FileStore,
    journal: &Journal,
    plan: &FilePlan,
    sync: bool,
) -> FsResult<()> {
    if plan.deleted {
        store.delete_files(plan.kind, &plan.id, plan.file_id)?;
        debug!(fsid = %plan.id, file_id = plan.file_id, "deleted data files");
        return Ok(());
    }
    let data = store
        .open_data(plan.kind, &plan.id, plan.file_id, true)?
        .ok_or_else(|| StorageFault::invalid_operation(format!("cannot create {}", plan.id)))?;
    if plan.truncate {
        data.truncate(0)?;
    }
    let mut buf = Vec::new();
    for w in &plan.writes {
        let mut done = 0;
        while done < w.len {
            let n = (w.len - done).min(COPY_CHUNK);
            buf.resize(n as usize, 0);
            journal.read_into(w.journal_offset + done, &mut buf)?;
            data.write_at(w.file_offset + done, &buf)?;
            done += n;
        }
    }
    if sync {
        data.sync()?;
    } else {
        data.flush()?;
    }
    if let Some(meta) = &plan.metadata {
        store.write_metadata(plan.kind, &plan.id, plan.file_id, meta)?;
    }
    debug!(
        fsid = %plan.id,
        file_id = plan.file_id,
        writes = plan.writes.len(),
        "applied file plan"
    );
    Ok(())
}

/// Index side of a plan: map new files, unmap and free deleted ones.
///
/// Index changes stay in memory until [`FileStore::flush_indexes`].
pub(crate) fn apply_plan_index(store: &FileStore, plan: &FilePlan) -> FsResult<()> {
    if plan.deleted {
        if store.lookup(plan.kind, &plan.id)? == Some(plan.file_id) {
            store.unmap(plan.kind, &plan.id)?;
        }
        store.release_file_id(plan.kind, plan.file_id);
    } else if plan.new_file {
        store.reserve_file_id(plan.kind, plan.file_id)?;
        store.map(plan.kind, &plan.id, plan.file_id)?;
    }
    Ok(())
}
