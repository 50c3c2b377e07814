//! Transaction state logs and the persistent id sequence.
//!
//! A state log is a small text file in the txlog directory named after the
//! transaction. Its first line is the state: `P` once prepared, `C` while
//! committing, and `D` followed by an `H <token>` line for a recovered
//! external transaction that was completed heuristically. The remaining
//! lines name the files the transaction touches:
//!
//! ```text
//! C
//! S ts /a/b
//! N ts /a/c 17
//! ```

use crate::dir::{remove_if_exists, write_atomic};
use crate::error::{FsResult, StorageFault};
use crate::fsid::FsId;
use crate::types::{FileKind, HeuristicOutcome, Xid};
use parking_lot::Mutex;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

/// Extension of per-transaction journals.
pub const JOURNAL_EXTENSION: &str = "journal";

const SEQUENCE_FILE: &str = "SEQUENCE";

/// Ids handed out per persisted sequence block.
const SEQUENCE_BLOCK: u64 = 1024;

/// State recorded in a log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogState {
    /// Prepared, no decision yet.
    Prepared,
    /// Decision is commit; application may be partial.
    Committing,
    /// Completed heuristically, waiting for `forget`.
    Dead(HeuristicOutcome),
}

/// One file named by a log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggedFile {
    /// Kind of file.
    pub kind: FileKind,
    /// Identifier.
    pub id: FsId,
    /// File id allocated by this transaction, if the file is new.
    pub new_file_id: Option<u64>,
}

/// Parsed state log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateLog {
    /// Transaction the log belongs to.
    pub xid: Xid,
    /// Recorded state.
    pub state: LogState,
    /// Files the transaction writes.
    pub files: Vec<LoggedFile>,
}

impl StateLog {
    /// Renders the log text.
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = String::new();
        match self.state {
            LogState::Prepared => out.push_str("P\n"),
            LogState::Committing => out.push_str("C\n"),
            LogState::Dead(outcome) => {
                let _ = writeln!(out, "D\nH {}", outcome.token());
            }
        }
        for file in &self.files {
            match file.new_file_id {
                Some(file_id) => {
                    let _ = writeln!(out, "N {} {} {file_id}", file.kind.tag(), file.id);
                }
                None => {
                    let _ = writeln!(out, "S {} {}", file.kind.tag(), file.id);
                }
            }
        }
        out
    }

    /// Parses log text.
    ///
    /// # Errors
    ///
    /// Returns `Corrupted` for anything that is not a well-formed log.
    pub fn parse(xid: Xid, text: &str) -> FsResult<Self> {
        let bad = |line: &str| StorageFault::corrupted(format!("bad log line {line:?} for {xid}"));
        let mut lines = text.lines();
        let mut state = match lines.next() {
            Some("P") => LogState::Prepared,
            Some("C") => LogState::Committing,
            Some("D") => LogState::Dead(HeuristicOutcome::Hazard),
            Some(other) => return Err(bad(other)),
            None => return Err(StorageFault::corrupted(format!("empty log for {xid}"))),
        };
        let mut files = Vec::new();
        for line in lines {
            if line.is_empty() {
                continue;
            }
            let (tag, rest) = line.split_once(' ').ok_or_else(|| bad(line))?;
            match tag {
                "H" if matches!(state, LogState::Dead(_)) => {
                    let outcome = HeuristicOutcome::from_token(rest).ok_or_else(|| bad(line))?;
                    state = LogState::Dead(outcome);
                }
                "S" => {
                    let (kind, id) = rest.split_once(' ').ok_or_else(|| bad(line))?;
                    files.push(LoggedFile {
                        kind: FileKind::from_tag(kind).ok_or_else(|| bad(line))?,
                        id: FsId::new(id)?,
                        new_file_id: None,
                    });
                }
                "N" => {
                    let (rest, file_id) = rest.rsplit_once(' ').ok_or_else(|| bad(line))?;
                    let (kind, id) = rest.split_once(' ').ok_or_else(|| bad(line))?;
                    files.push(LoggedFile {
                        kind: FileKind::from_tag(kind).ok_or_else(|| bad(line))?,
                        id: FsId::new(id)?,
                        new_file_id: Some(file_id.parse().map_err(|_| bad(line))?),
                    });
                }
                _ => return Err(bad(line)),
            }
        }
        Ok(Self { xid, state, files })
    }
}

/// The txlog directory.
pub struct TxLogDir {
    path: PathBuf,
    sequence: Mutex<SequenceState>,
}

struct SequenceState {
    next: u64,
    reserved: u64,
}

impl TxLogDir {
    /// Opens the directory, creating it if needed.
    pub fn open(path: &Path) -> FsResult<Self> {
        fs::create_dir_all(path)?;
        let next = match fs::read_to_string(path.join(SEQUENCE_FILE)) {
            Ok(text) => text.trim().parse::<u64>().map_err(|_| {
                StorageFault::corrupted(format!("bad transaction sequence {:?}", text.trim()))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 1,
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path: path.to_path_buf(),
            sequence: Mutex::new(SequenceState {
                next,
                reserved: next,
            }),
        })
    }

    /// Directory path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Next local transaction number. Never repeats across restarts.
    pub fn next_id(&self) -> FsResult<u64> {
        let mut seq = self.sequence.lock();
        if seq.next >= seq.reserved {
            let reserved = seq.next + SEQUENCE_BLOCK;
            write_atomic(
                &self.path.join(SEQUENCE_FILE),
                format!("{reserved}\n").as_bytes(),
            )?;
            seq.reserved = reserved;
        }
        let id = seq.next;
        seq.next += 1;
        Ok(id)
    }

    /// Moves the sequence past ids seen in leftover logs.
    pub fn bump_past(&self, id: u64) {
        let mut seq = self.sequence.lock();
        if seq.next <= id {
            seq.next = id + 1;
        }
    }

    /// Path of the state log of `xid`.
    #[must_use]
    pub fn log_path(&self, xid: &Xid) -> PathBuf {
        self.path
            .join(format!("{}.{}", xid.log_stem(), xid.log_extension()))
    }

    /// Path of the journal of `xid`.
    #[must_use]
    pub fn journal_path(&self, xid: &Xid) -> PathBuf {
        self.path
            .join(format!("{}.{JOURNAL_EXTENSION}", xid.log_stem()))
    }

    /// Durably writes a log.
    pub fn write(&self, log: &StateLog) -> FsResult<()> {
        write_atomic(&self.log_path(&log.xid), log.render().as_bytes())
    }

    /// Reads the log of `xid`, if present.
    pub fn read(&self, xid: &Xid) -> FsResult<Option<StateLog>> {
        match fs::read_to_string(self.log_path(xid)) {
            Ok(text) => StateLog::parse(xid.clone(), &text).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Removes the log and journal of `xid`.
    pub fn remove(&self, xid: &Xid) -> FsResult<()> {
        remove_if_exists(&self.journal_path(xid))?;
        remove_if_exists(&self.log_path(xid))?;
        Ok(())
    }

    /// Lists leftover logs and journals.
    pub fn entries(&self) -> FsResult<TxLogEntries> {
        let mut entries = TxLogEntries::default();
        for entry in fs::read_dir(&self.path)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                entries.unknown.push(entry.path());
                continue;
            };
            if name == SEQUENCE_FILE {
                continue;
            }
            let Some((stem, ext)) = name.rsplit_once('.') else {
                entries.unknown.push(entry.path());
                continue;
            };
            if ext == JOURNAL_EXTENSION {
                entries.journals.push(stem.to_string());
            } else if let Some(xid) = Xid::from_log_stem(stem, ext) {
                entries.logs.push(xid);
            } else {
                entries.unknown.push(entry.path());
            }
        }
        entries.logs.sort_by_key(Xid::log_stem);
        entries.journals.sort();
        Ok(entries)
    }
}

/// Contents of the txlog directory.
#[derive(Debug, Default)]
pub struct TxLogEntries {
    /// Transactions with a state log.
    pub logs: Vec<Xid>,
    /// Stems of journal files.
    pub journals: Vec<String>,
    /// Files that are neither, such as stale temporaries.
    pub unknown: Vec<PathBuf>,
}
