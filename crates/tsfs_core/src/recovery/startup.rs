//! Startup replay of the transaction logs.

use crate::config::EngineConfig;
use crate::dir::remove_if_exists;
use crate::error::{FsResult, StorageFault};
use crate::store::FileStore;
use crate::txn::{Journal, LogState, LoggedFile, StateLog, TxLogDir};
use crate::types::{HeuristicOutcome, Xid, LOCAL_LOG_EXTENSION};
use crate::xfile::{apply_plan, apply_plan_index};
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info, warn};

/// What startup recovery did.
#[derive(Debug, Default, Clone, Serialize)]
pub struct RecoveryReport {
    /// Committing transactions replayed to completion.
    pub replayed: Vec<String>,
    /// Prepared or torn transactions rolled back.
    pub rolled_back: Vec<String>,
    /// External transactions forgotten because of configuration.
    pub forgotten: Vec<String>,
    /// Journals without a log that were removed.
    pub orphan_journals: usize,
    /// Stale temporaries removed from the txlog directory.
    pub stale_files: usize,
    /// External transactions completed heuristically, awaiting `forget`.
    #[serde(skip)]
    pub heuristic: HashMap<Xid, HeuristicOutcome>,
}

impl RecoveryReport {
    /// Returns true if the logs were already clean.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.replayed.is_empty()
            && self.rolled_back.is_empty()
            && self.forgotten.is_empty()
            && self.orphan_journals == 0
            && self.stale_files == 0
    }
}

/// Brings the store to a transaction-consistent state.
///
/// Committing transactions are replayed, prepared ones rolled back. Both
/// steps are idempotent: a crash in the middle of recovery is repaired by
/// running it again. External transactions keep a `D` log recording their
/// heuristic outcome unless `forget_xa_on_startup` is set.
///
/// # Errors
///
/// Any state that replay cannot resolve is a `Recovery` fault; the engine
/// must not start on top of it.
pub fn recover_store(
    store: &FileStore,
    txlog: &TxLogDir,
    config: &EngineConfig,
) -> FsResult<RecoveryReport> {
    let entries = txlog.entries()?;
    let mut report = RecoveryReport::default();

    for xid in &entries.logs {
        if let Xid::Local(id) = xid {
            txlog.bump_past(id.as_u64());
        }
        let log = match txlog.read(xid) {
            Ok(Some(log)) => log,
            Ok(None) => continue,
            Err(e @ (StorageFault::Corrupted { .. } | StorageFault::InvalidId { .. })) => {
                warn!(%xid, error = %e, "unreadable transaction log, rolling back");
                discard_journal(store, &txlog.journal_path(xid))?;
                finish(txlog, xid, HeuristicOutcome::RolledBack, config, &mut report)?;
                report.rolled_back.push(xid.to_string());
                continue;
            }
            Err(e) => return Err(e),
        };
        match log.state {
            LogState::Committing => {
                replay(store, txlog, &log)?;
                info!(%xid, files = log.files.len(), "replayed committed transaction");
                finish(txlog, xid, HeuristicOutcome::Committed, config, &mut report)?;
                report.replayed.push(xid.to_string());
            }
            LogState::Prepared => {
                discard(store, txlog, &log)?;
                info!(%xid, files = log.files.len(), "rolled back prepared transaction");
                finish(txlog, xid, HeuristicOutcome::RolledBack, config, &mut report)?;
                report.rolled_back.push(xid.to_string());
            }
            LogState::Dead(outcome) => {
                remove_if_exists(&txlog.journal_path(xid))?;
                if xid.is_external() {
                    finish(txlog, xid, outcome, config, &mut report)?;
                } else {
                    txlog.remove(xid)?;
                }
            }
        }
    }

    for stem in &entries.journals {
        if let Some(Xid::Local(id)) = Xid::from_log_stem(stem, LOCAL_LOG_EXTENSION) {
            txlog.bump_past(id.as_u64());
        }
        let path = txlog
            .path()
            .join(format!("{stem}.{}", crate::txn::log::JOURNAL_EXTENSION));
        if !path.exists() {
            continue;
        }
        discard_journal(store, &path)?;
        report.orphan_journals += 1;
    }

    for path in &entries.unknown {
        if path.extension().is_some_and(|e| e == "tmp") {
            remove_if_exists(path)?;
            report.stale_files += 1;
        } else {
            warn!(path = %path.display(), "unexpected file in txlog directory");
        }
    }

    store.flush_indexes()?;
    if !report.is_clean() {
        info!(
            replayed = report.replayed.len(),
            rolled_back = report.rolled_back.len(),
            heuristic = report.heuristic.len(),
            orphan_journals = report.orphan_journals,
            "recovery complete"
        );
    }
    Ok(report)
}

/// Re-applies every plan of a committing transaction.
fn replay(store: &FileStore, txlog: &TxLogDir, log: &StateLog) -> FsResult<()> {
    let path = txlog.journal_path(&log.xid);
    if !path.exists() {
        // Commit removes the journal before the log, so everything landed.
        debug!(xid = %log.xid, "journal already removed");
        return Ok(());
    }
    let journal = Journal::open(&path)?;
    let scan = journal.scan().map_err(|e| {
        StorageFault::recovery(format!("journal of committed {} is unusable: {e}", log.xid))
    })?;
    for file in &log.files {
        let planned = scan
            .plans
            .iter()
            .any(|p| p.kind == file.kind && p.id == file.id);
        if !planned {
            return Err(StorageFault::recovery(format!(
                "committed {} has no plan for {}",
                log.xid, file.id
            )));
        }
    }
    for plan in &scan.plans {
        apply_plan(store, &journal, plan, true)?;
        apply_plan_index(store, plan)
            .map_err(|e| StorageFault::recovery(format!("replay of {}: {e}", plan.id)))?;
    }
    store.flush_indexes()
}

/// Removes what a prepared transaction created.
fn discard(store: &FileStore, txlog: &TxLogDir, log: &StateLog) -> FsResult<()> {
    for file in &log.files {
        remove_stray(store, file)?;
    }
    discard_journal(store, &txlog.journal_path(&log.xid))
}

/// Deletes a journal, first removing data files pre-created for its plans.
fn discard_journal(store: &FileStore, path: &Path) -> FsResult<()> {
    if !path.exists() {
        return Ok(());
    }
    match Journal::open(path).and_then(|j| j.scan()) {
        Ok(scan) => {
            for plan in scan.plans.iter().filter(|p| p.new_file) {
                remove_stray(
                    store,
                    &LoggedFile {
                        kind: plan.kind,
                        id: plan.id.clone(),
                        new_file_id: Some(plan.file_id),
                    },
                )?;
            }
        }
        Err(e) => warn!(path = %path.display(), error = %e, "discarding unreadable journal"),
    }
    remove_if_exists(path)?;
    debug!(path = %path.display(), "journal discarded");
    Ok(())
}

fn remove_stray(store: &FileStore, file: &LoggedFile) -> FsResult<()> {
    let Some(file_id) = file.new_file_id else {
        return Ok(());
    };
    if store.lookup(file.kind, &file.id)? == Some(file_id) {
        return Err(StorageFault::recovery(format!(
            "{} is mapped to uncommitted file {file_id}",
            file.id
        )));
    }
    store.delete_files(file.kind, &file.id, file_id)
}

/// Drops the log of a local transaction; records the outcome of an external one.
fn finish(
    txlog: &TxLogDir,
    xid: &Xid,
    outcome: HeuristicOutcome,
    config: &EngineConfig,
    report: &mut RecoveryReport,
) -> FsResult<()> {
    if !xid.is_external() {
        return txlog.remove(xid);
    }
    if config.forget_xa_on_startup {
        txlog.remove(xid)?;
        report.forgotten.push(xid.to_string());
        return Ok(());
    }
    let files = match txlog.read(xid) {
        Ok(Some(log)) => log.files,
        _ => Vec::new(),
    };
    txlog.write(&StateLog {
        xid: xid.clone(),
        state: LogState::Dead(outcome),
        files,
    })?;
    remove_if_exists(&txlog.journal_path(xid))?;
    report.heuristic.insert(xid.clone(), outcome);
    info!(%xid, %outcome, "external transaction completed heuristically");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dir::EngineDir;
    use crate::fsid::FsId;
    use crate::metadata::{FileMetadata, StoredMetadata};
    use crate::txn::{FilePlan, PlanWrite};
    use crate::types::{DataType, FileKind, GlobalXid, TransactionId};
    use tempfile::TempDir;

    struct Setup {
        _temp: TempDir,
        _dir: EngineDir,
        store: FileStore,
        txlog: TxLogDir,
        config: EngineConfig,
    }

    fn setup() -> Setup {
        let temp = tempfile::tempdir().unwrap();
        let config = EngineConfig::new(temp.path());
        let dir = EngineDir::open(temp.path(), true).unwrap();
        let store = FileStore::open(&dir, &config).unwrap();
        let txlog = TxLogDir::open(&dir.txlog_dir()).unwrap();
        Setup {
            _temp: temp,
            _dir: dir,
            store,
            txlog,
            config,
        }
    }

    /// Journals a new 4-byte series write for `name` and logs it in `state`.
    fn stage(s: &Setup, xid: &Xid, name: &str, state: LogState) -> (FsId, u64) {
        let id = FsId::new(name).unwrap();
        let file_id = s.store.allocate_file_id(FileKind::TimeSeries).unwrap();
        let journal = Journal::open(&s.txlog.journal_path(xid)).unwrap();
        let offset = journal.append_data(&7i32.to_le_bytes()).unwrap();
        let mut meta = FileMetadata::new(DataType::Int);
        meta.valid = crate::interval::IntervalSet::from_intervals(vec![
            crate::interval::SimpleInterval::new(0, 3),
        ]);
        let plan = FilePlan {
            kind: FileKind::TimeSeries,
            id: id.clone(),
            file_id,
            new_file: true,
            truncate: false,
            deleted: false,
            writes: vec![PlanWrite {
                file_offset: 0,
                journal_offset: offset,
                len: 4,
            }],
            metadata: Some(StoredMetadata::Series(meta)),
        };
        journal.append_plan(&plan).unwrap();
        journal.sync().unwrap();
        s.store
            .open_data(FileKind::TimeSeries, &id, file_id, true)
            .unwrap();
        s.txlog
            .write(&StateLog {
                xid: xid.clone(),
                state,
                files: vec![LoggedFile {
                    kind: FileKind::TimeSeries,
                    id: id.clone(),
                    new_file_id: Some(file_id),
                }],
            })
            .unwrap();
        (id, file_id)
    }

    #[test]
    fn committing_logs_are_replayed_twice_safely() {
        let s = setup();
        let xid = Xid::Local(TransactionId::new(40));
        let (id, file_id) = stage(&s, &xid, "/c", LogState::Committing);

        let report = recover_store(&s.store, &s.txlog, &s.config).unwrap();
        assert_eq!(report.replayed, vec![xid.to_string()]);
        assert_eq!(s.store.lookup(FileKind::TimeSeries, &id).unwrap(), Some(file_id));
        let first = std::fs::read(s.store.data_path(FileKind::TimeSeries, &id, file_id).unwrap())
            .unwrap();
        assert_eq!(first, 7i32.to_le_bytes());

        let again = recover_store(&s.store, &s.txlog, &s.config).unwrap();
        assert!(again.is_clean());
        assert!(s.txlog.next_id().unwrap() > 40);
    }

    #[test]
    fn prepared_logs_are_rolled_back() {
        let s = setup();
        let xid = Xid::Local(TransactionId::new(3));
        let (id, file_id) = stage(&s, &xid, "/p", LogState::Prepared);
        let data = s.store.data_path(FileKind::TimeSeries, &id, file_id).unwrap();
        assert!(data.exists());

        let report = recover_store(&s.store, &s.txlog, &s.config).unwrap();
        assert_eq!(report.rolled_back.len(), 1);
        assert!(!data.exists());
        assert_eq!(s.store.lookup(FileKind::TimeSeries, &id).unwrap(), None);
        let entries = s.txlog.entries().unwrap();
        assert!(entries.logs.is_empty() && entries.journals.is_empty());
    }

    #[test]
    fn external_outcomes_survive_until_forgotten() {
        let s = setup();
        let committed = Xid::Global(GlobalXid::new(1, b"c", b""));
        let prepared = Xid::Global(GlobalXid::new(1, b"p", b""));
        stage(&s, &committed, "/xc", LogState::Committing);
        stage(&s, &prepared, "/xp", LogState::Prepared);

        let report = recover_store(&s.store, &s.txlog, &s.config).unwrap();
        assert_eq!(report.heuristic[&committed], HeuristicOutcome::Committed);
        assert_eq!(report.heuristic[&prepared], HeuristicOutcome::RolledBack);

        let again = recover_store(&s.store, &s.txlog, &s.config).unwrap();
        assert_eq!(again.heuristic.len(), 2);
        assert!(s.txlog.entries().unwrap().journals.is_empty());

        let forgetting = EngineConfig {
            forget_xa_on_startup: true,
            ..s.config.clone()
        };
        let last = recover_store(&s.store, &s.txlog, &forgetting).unwrap();
        assert_eq!(last.forgotten.len(), 2);
        assert!(s.txlog.entries().unwrap().logs.is_empty());
    }

    #[test]
    fn orphan_journals_are_discarded() {
        let s = setup();
        let orphan = Xid::Local(TransactionId::new(8));
        let (id, file_id) = stage(&s, &orphan, "/o", LogState::Prepared);
        std::fs::remove_file(s.txlog.log_path(&orphan)).unwrap();

        let report = recover_store(&s.store, &s.txlog, &s.config).unwrap();
        assert_eq!(report.orphan_journals, 1);
        assert!(!s
            .store
            .data_path(FileKind::TimeSeries, &id, file_id)
            .unwrap()
            .exists());
        assert!(!s.txlog.journal_path(&orphan).exists());
    }

    #[test]
    fn garbage_logs_are_rolled_back() {
        let s = setup();
        let xid = Xid::Local(TransactionId::new(9));
        let (id, file_id) = stage(&s, &xid, "/g", LogState::Prepared);
        std::fs::write(s.txlog.log_path(&xid), b"not a log").unwrap();

        let report = recover_store(&s.store, &s.txlog, &s.config).unwrap();
        assert_eq!(report.rolled_back, vec![xid.to_string()]);
        assert!(!s
            .store
            .data_path(FileKind::TimeSeries, &id, file_id)
            .unwrap()
            .exists());
        assert!(s.txlog.entries().unwrap().logs.is_empty());
    }

    #[test]
    fn missing_plans_are_fatal() {
        let s = setup();
        let xid = Xid::Local(TransactionId::new(5));
        Journal::open(&s.txlog.journal_path(&xid)).unwrap();
        s.txlog
            .write(&StateLog {
                xid: xid.clone(),
                state: LogState::Committing,
                files: vec![LoggedFile {
                    kind: FileKind::Blob,
                    id: FsId::new("/lost").unwrap(),
                    new_file_id: None,
                }],
            })
            .unwrap();
        let err = recover_store(&s.store, &s.txlog, &s.config).unwrap_err();
        assert!(matches!(err, StorageFault::Recovery { .. }));
    }
}
