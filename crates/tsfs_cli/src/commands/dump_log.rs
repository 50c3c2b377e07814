//! Dump-log command implementation.
//!
//! Reads the txlog directory directly, without opening an engine, so the
//! logs are shown as the previous run left them instead of after recovery.

use serde::Serialize;
use std::path::Path;
use tsfs_core::txn::{Journal, LogState, StateLog};
use tsfs_core::{EngineDir, TxLogDir, Xid};

/// One transaction log.
#[derive(Debug, Serialize)]
pub struct LogEntry {
    /// Transaction id.
    pub xid: String,
    /// Recorded state, or why the log could not be read.
    pub state: String,
    /// Files named by the log.
    pub files: Vec<String>,
    /// Plans in the journal, if one exists.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub journal_plans: Option<usize>,
    /// Whether the journal ends in a torn record.
    pub journal_torn: bool,
}

/// Everything left in the txlog directory.
#[derive(Debug, Default, Serialize)]
pub struct LogDump {
    /// Transaction logs, in file-name order.
    pub logs: Vec<LogEntry>,
    /// Journals with no log.
    pub orphan_journals: Vec<String>,
    /// Other files.
    pub unknown: Vec<String>,
}

/// Runs the dump-log command.
pub fn run(path: &Path, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let dump = collect(path)?;
    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&dump)?),
        _ => print_text_output(&dump),
    }
    Ok(())
}

/// Reads the txlog directory of the store at `path` under the store lock.
pub fn collect(path: &Path) -> tsfs_core::FsResult<LogDump> {
    let dir = EngineDir::open(path, false)?;
    let txlog = TxLogDir::open(&dir.txlog_dir())?;
    let entries = txlog.entries()?;

    let mut dump = LogDump::default();
    for xid in &entries.logs {
        dump.logs.push(describe(&txlog, xid)?);
    }
    let stems: Vec<String> = entries.logs.iter().map(Xid::log_stem).collect();
    dump.orphan_journals = entries
        .journals
        .into_iter()
        .filter(|stem| !stems.contains(stem))
        .collect();
    dump.unknown = entries
        .unknown
        .iter()
        .map(|p| p.display().to_string())
        .collect();
    Ok(dump)
}

fn describe(txlog: &TxLogDir, xid: &Xid) -> tsfs_core::FsResult<LogEntry> {
    let (state, files) = match txlog.read(xid) {
        Ok(Some(log)) => (state_text(&log), file_lines(&log)),
        Ok(None) => ("vanished".to_string(), Vec::new()),
        Err(e) => (format!("unreadable: {e}"), Vec::new()),
    };
    let journal_path = txlog.journal_path(xid);
    let (journal_plans, journal_torn) = if journal_path.exists() {
        let scan = Journal::open(&journal_path)?.scan()?;
        (Some(scan.plans.len()), scan.torn)
    } else {
        (None, false)
    };
    Ok(LogEntry {
        xid: xid.to_string(),
        state,
        files,
        journal_plans,
        journal_torn,
    })
}

fn state_text(log: &StateLog) -> String {
    match log.state {
        LogState::Prepared => "prepared".to_string(),
        LogState::Committing => "committing".to_string(),
        LogState::Dead(outcome) => format!("completed ({outcome})"),
    }
}

fn file_lines(log: &StateLog) -> Vec<String> {
    log.files
        .iter()
        .map(|f| match f.new_file_id {
            Some(file_id) => format!("{} {} (new file {file_id})", f.kind, f.id),
            None => format!("{} {}", f.kind, f.id),
        })
        .collect()
}

fn print_text_output(dump: &LogDump) {
    if dump.logs.is_empty() && dump.orphan_journals.is_empty() && dump.unknown.is_empty() {
        println!("No leftover transaction logs");
        return;
    }
    for entry in &dump.logs {
        println!("{}: {}", entry.xid, entry.state);
        for file in &entry.files {
            println!("  {file}");
        }
        match entry.journal_plans {
            Some(plans) if entry.journal_torn => println!("  journal: {plans} plans, torn tail"),
            Some(plans) => println!("  journal: {plans} plans"),
            None => println!("  journal: none"),
        }
    }
    for stem in &dump.orphan_journals {
        println!("orphan journal: {stem}");
    }
    for path in &dump.unknown {
        println!("unknown file: {path}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tsfs_core::{Engine, EngineConfig, FileKind, FsId, TransactionState};

    #[test]
    fn prepared_external_transaction_is_listed() {
        let temp = tempfile::tempdir().unwrap();
        let engine = Engine::open(EngineConfig::new(temp.path())).unwrap();
        let manager = engine.transactions();
        let xid = manager
            .start_external(tsfs_core::GlobalXid::new(1, b"g", b"b"), None)
            .unwrap();
        let id = FsId::new("/d/1").unwrap();
        let backend = tsfs_core::TransactionalBackend::new(std::sync::Arc::new(engine));
        tsfs_core::FileStoreBackend::write_blob(&backend, &xid, &id, 3, b"abc").unwrap();
        assert!(matches!(
            tsfs_core::TransactionService::prepare(&backend, &xid).unwrap(),
            tsfs_core::Vote::Commit
        ));
        assert_eq!(
            backend.engine().transactions().state(&xid).unwrap(),
            TransactionState::Prepared { read_only: false }
        );
        drop(backend);

        let dump = collect(temp.path()).unwrap();
        assert_eq!(dump.logs.len(), 1);
        assert_eq!(dump.logs[0].state, "prepared");
        assert_eq!(dump.logs[0].files.len(), 1);
        assert!(dump.logs[0].files[0].contains(&FileKind::Blob.to_string()));
        assert_eq!(dump.logs[0].journal_plans, Some(1));
        assert!(!dump.logs[0].journal_torn);
    }
}
