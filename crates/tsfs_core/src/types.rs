//! Core type definitions for tsfs.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a locally begun transaction.
///
/// Transaction ids come from a persistent sequence and are never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TransactionId(pub u64);

impl TransactionId {
    /// Creates a new transaction ID.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw ID value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn:{}", self.0)
    }
}

/// Transaction branch id assigned by an external coordinator.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GlobalXid {
    /// Coordinator specific format identifier.
    pub format_id: i32,
    /// Global transaction id.
    pub global_id: Vec<u8>,
    /// Branch qualifier.
    pub branch_qualifier: Vec<u8>,
}

impl GlobalXid {
    /// Creates a global transaction id.
    #[must_use]
    pub fn new(format_id: i32, global_id: &[u8], branch_qualifier: &[u8]) -> Self {
        Self {
            format_id,
            global_id: global_id.to_vec(),
            branch_qualifier: branch_qualifier.to_vec(),
        }
    }
}

/// Any transaction known to the manager.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Xid {
    /// Begun with `begin()`; this engine is its own coordinator.
    Local(TransactionId),
    /// Begun with `start_external()`; an outside coordinator decides.
    Global(GlobalXid),
}

impl Xid {
    /// Returns true for externally coordinated transactions.
    #[must_use]
    pub fn is_external(&self) -> bool {
        matches!(self, Self::Global(_))
    }

    /// File stem used for this transaction's log and journal.
    #[must_use]
    pub fn log_stem(&self) -> String {
        match self {
            Self::Local(id) => format!("{:016x}", id.as_u64()),
            Self::Global(g) => format!(
                "{:08x}-{}-{}",
                g.format_id as u32,
                to_hex(&g.global_id),
                to_hex(&g.branch_qualifier)
            ),
        }
    }

    /// Extension of the state log file.
    #[must_use]
    pub fn log_extension(&self) -> &'static str {
        match self {
            Self::Local(_) => LOCAL_LOG_EXTENSION,
            Self::Global(_) => XA_LOG_EXTENSION,
        }
    }

    /// Parses a log file stem back into a transaction id.
    #[must_use]
    pub fn from_log_stem(stem: &str, extension: &str) -> Option<Self> {
        match extension {
            LOCAL_LOG_EXTENSION => u64::from_str_radix(stem, 16)
                .ok()
                .map(|n| Self::Local(TransactionId::new(n))),
            XA_LOG_EXTENSION => {
                let mut parts = stem.splitn(3, '-');
                let format_id = u32::from_str_radix(parts.next()?, 16).ok()? as i32;
                let global_id = from_hex(parts.next()?)?;
                let branch_qualifier = from_hex(parts.next()?)?;
                Some(Self::Global(GlobalXid {
                    format_id,
                    global_id,
                    branch_qualifier,
                }))
            }
            _ => None,
        }
    }
}

impl fmt::Display for Xid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local(id) => write!(f, "local:{}", id.as_u64()),
            Self::Global(g) => write!(
                f,
                "xa:{}:{}:{}",
                g.format_id,
                to_hex(&g.global_id),
                to_hex(&g.branch_qualifier)
            ),
        }
    }
}

/// Extension of state logs for local transactions.
pub const LOCAL_LOG_EXTENSION: &str = "local";
/// Extension of state logs for externally coordinated transactions.
pub const XA_LOG_EXTENSION: &str = "xa";

fn to_hex(bytes: &[u8]) -> String {
    use fmt::Write;
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(s, "{b:02x}");
    }
    s
}

fn from_hex(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(s.get(i..i + 2)?, 16).ok())
        .collect()
}

/// Element type of a time series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    /// 32-bit signed integers.
    Int,
    /// 32-bit floats.
    Float,
    /// 64-bit floats.
    Double,
}

impl DataType {
    /// Width in bytes of one cadence.
    #[must_use]
    pub const fn width(self) -> u64 {
        match self {
            Self::Int | Self::Float => 4,
            Self::Double => 8,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Int => "int",
            Self::Float => "float",
            Self::Double => "double",
        };
        f.write_str(name)
    }
}

/// Kind of stored item. Each kind has its own index and directory tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum FileKind {
    /// Cadence addressed random-access file.
    TimeSeries,
    /// Opaque byte stream.
    Blob,
    /// Points keyed by modified Julian date.
    Mjd,
}

impl FileKind {
    /// All kinds, in index order.
    pub const ALL: [FileKind; 3] = [FileKind::TimeSeries, FileKind::Blob, FileKind::Mjd];

    /// Position of this kind in per-kind arrays.
    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Self::TimeSeries => 0,
            Self::Blob => 1,
            Self::Mjd => 2,
        }
    }

    /// Directory and index file name.
    #[must_use]
    pub const fn dir_name(self) -> &'static str {
        match self {
            Self::TimeSeries => "timeseries",
            Self::Blob => "blob",
            Self::Mjd => "mjd",
        }
    }

    /// Short tag used in transaction logs.
    #[must_use]
    pub const fn tag(self) -> &'static str {
        match self {
            Self::TimeSeries => "ts",
            Self::Blob => "blob",
            Self::Mjd => "mjd",
        }
    }

    /// Parses a log tag.
    #[must_use]
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "ts" => Some(Self::TimeSeries),
            "blob" => Some(Self::Blob),
            "mjd" => Some(Self::Mjd),
            _ => None,
        }
    }

    pub(crate) const fn as_byte(self) -> u8 {
        self.index() as u8
    }

    pub(crate) fn from_byte(b: u8) -> Option<Self> {
        Self::ALL.get(b as usize).copied()
    }
}

impl fmt::Display for FileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// How a transaction was completed without its coordinator's decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HeuristicOutcome {
    /// All work was rolled back.
    RolledBack,
    /// All work was committed.
    Committed,
    /// Some work committed, some rolled back.
    Mixed,
    /// The outcome of some work is unknown.
    Hazard,
}

impl HeuristicOutcome {
    /// Log line token.
    #[must_use]
    pub const fn token(self) -> &'static str {
        match self {
            Self::RolledBack => "HEURRB",
            Self::Committed => "HEURCOM",
            Self::Mixed => "HEURMIX",
            Self::Hazard => "HEURHAZ",
        }
    }

    /// Parses a log line token.
    #[must_use]
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "HEURRB" => Some(Self::RolledBack),
            "HEURCOM" => Some(Self::Committed),
            "HEURMIX" => Some(Self::Mixed),
            "HEURHAZ" => Some(Self::Hazard),
            _ => None,
        }
    }
}

impl fmt::Display for HeuristicOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::RolledBack => "heuristic rollback",
            Self::Committed => "heuristic commit",
            Self::Mixed => "heuristic mixed",
            Self::Hazard => "heuristic hazard",
        };
        f.write_str(text)
    }
}

/// Result of `prepare`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vote {
    /// Nothing was written; the transaction is already complete.
    ReadOnly,
    /// Prepared; commit is expected to succeed.
    Commit,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transaction_id_ordering() {
        assert!(TransactionId::new(1) < TransactionId::new(2));
    }

    #[test]
    fn local_xid_log_name_round_trip() {
        let xid = Xid::Local(TransactionId::new(0xBEEF));
        let stem = xid.log_stem();
        assert_eq!(stem, "000000000000beef");
        assert_eq!(Xid::from_log_stem(&stem, xid.log_extension()), Some(xid));
    }

    #[test]
    fn global_xid_log_name_round_trip() {
        let xid = Xid::Global(GlobalXid::new(-7, b"gtrid", b""));
        let stem = xid.log_stem();
        assert_eq!(Xid::from_log_stem(&stem, "xa"), Some(xid.clone()));
        assert_eq!(xid.to_string(), "xa:-7:6774726964:");
    }

    #[test]
    fn bad_log_names_rejected() {
        assert_eq!(Xid::from_log_stem("zz", "local"), None);
        assert_eq!(Xid::from_log_stem("0001-abc-", "xa"), None);
        assert_eq!(Xid::from_log_stem("01", "journal"), None);
    }

    #[test]
    fn widths() {
        assert_eq!(DataType::Int.width(), 4);
        assert_eq!(DataType::Float.width(), 4);
        assert_eq!(DataType::Double.width(), 8);
    }

    #[test]
    fn heuristic_tokens() {
        for o in [
            HeuristicOutcome::RolledBack,
            HeuristicOutcome::Committed,
            HeuristicOutcome::Mixed,
            HeuristicOutcome::Hazard,
        ] {
            assert_eq!(HeuristicOutcome::from_token(o.token()), Some(o));
        }
    }

    #[test]
    fn kind_tags() {
        for k in FileKind::ALL {
            assert_eq!(FileKind::from_tag(k.tag()), Some(k));
            assert_eq!(FileKind::from_byte(k.as_byte()), Some(k));
        }
    }
}
