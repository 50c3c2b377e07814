//! Per-transaction data journal.
//!
//! Everything a transaction writes is appended to its journal first; data
//! files are only touched when a committed plan is applied. Records use the
//! envelope `magic | version | type | len | payload | crc32`.

use crate::codec::{compute_crc32, put_blob, ByteReader};
use crate::error::{FsResult, StorageFault};
use crate::fsid::FsId;
use crate::metadata::StoredMetadata;
use crate::types::FileKind;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tsfs_storage::{FileBackend, StorageBackend};

/// Magic bytes of a journal record.
pub const JOURNAL_MAGIC: [u8; 4] = *b"TSJR";

/// Current journal format version.
pub const JOURNAL_VERSION: u16 = 1;

/// magic (4) + version (2) + type (1) + length (4)
const HEADER_SIZE: usize = 11;
const CRC_SIZE: usize = 4;

const FLAG_NEW: u8 = 1;
const FLAG_TRUNCATE: u8 = 2;
const FLAG_DELETED: u8 = 4;

/// Type of journal record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum JournalRecordType {
    /// Raw bytes referenced by plans.
    Data = 1,
    /// Final state of one file.
    Plan = 2,
}

impl JournalRecordType {
    /// Converts a byte to a record type.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Data),
            2 => Some(Self::Plan),
            _ => None,
        }
    }
}

/// One positioned write of journaled bytes into a data file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanWrite {
    /// Destination offset in the data file.
    pub file_offset: u64,
    /// Offset of the bytes in the journal.
    pub journal_offset: u64,
    /// Number of bytes.
    pub len: u64,
}

impl PlanWrite {
    /// One past the last destination byte.
    #[must_use]
    pub fn file_end(&self) -> u64 {
        self.file_offset + self.len
    }
}

/// Everything needed to bring one data file to its committed state.
///
/// Applying a plan twice has the same effect as applying it once.
#[derive(Debug, Clone, PartialEq)]
pub struct FilePlan {
    /// Kind of file.
    pub kind: FileKind,
    /// Identifier.
    pub id: FsId,
    /// Data file id.
    pub file_id: u64,
    /// The identifier had no mapping before this transaction.
    pub new_file: bool,
    /// Committed content is discarded before the writes are applied.
    pub truncate: bool,
    /// The identifier is deleted.
    pub deleted: bool,
    /// Writes in application order.
    pub writes: Vec<PlanWrite>,
    /// Metadata written after the data.
    pub metadata: Option<StoredMetadata>,
}

impl FilePlan {
    fn encode(&self) -> FsResult<Vec<u8>> {
        let mut buf = Vec::with_capacity(32 + self.writes.len() * 24);
        buf.push(self.kind.as_byte());
        put_blob(&mut buf, self.id.as_str().as_bytes());
        buf.extend_from_slice(&self.file_id.to_le_bytes());
        let mut flags = 0;
        if self.new_file {
            flags |= FLAG_NEW;
        }
        if self.truncate {
            flags |= FLAG_TRUNCATE;
        }
        if self.deleted {
            flags |= FLAG_DELETED;
        }
        buf.push(flags);
        let count = u32::try_from(self.writes.len())
            .map_err(|_| StorageFault::invalid_operation("too many writes in one file plan"))?;
        buf.extend_from_slice(&count.to_le_bytes());
        for w in &self.writes {
            buf.extend_from_slice(&w.file_offset.to_le_bytes());
            buf.extend_from_slice(&w.journal_offset.to_le_bytes());
            buf.extend_from_slice(&w.len.to_le_bytes());
        }
        match &self.metadata {
            Some(meta) => put_blob(&mut buf, &meta.encode()?),
            None => put_blob(&mut buf, &[]),
        }
        Ok(buf)
    }

    fn decode(payload: &[u8]) -> FsResult<Self> {
        let mut r = ByteReader::new(payload, "file plan");
        let kind = FileKind::from_byte(r.u8()?)
            .ok_or_else(|| StorageFault::corrupted("file plan has an unknown kind"))?;
        let id = std::str::from_utf8(r.blob()?)
            .map_err(|_| StorageFault::corrupted("file plan id is not utf-8"))
            .and_then(FsId::new)?;
        let file_id = r.u64()?;
        let flags = r.u8()?;
        let count = r.u32()? as usize;
        let mut writes = Vec::with_capacity(count.min(r.remaining() / 24));
        for _ in 0..count {
            writes.push(PlanWrite {
                file_offset: r.u64()?,
                journal_offset: r.u64()?,
                len: r.u64()?,
            });
        }
        let meta = r.blob()?;
        let metadata = if meta.is_empty() {
            None
        } else {
            Some(StoredMetadata::decode(meta)?)
        };
        r.finish()?;
        Ok(Self {
            kind,
            id,
            file_id,
            new_file: flags & FLAG_NEW != 0,
            truncate: flags & FLAG_TRUNCATE != 0,
            deleted: flags & FLAG_DELETED != 0,
            writes,
            metadata,
        })
    }
}

/// Append-only journal of one transaction.
pub struct Journal {
    path: PathBuf,
    backend: Arc<dyn StorageBackend>,
}

impl Journal {
    /// Creates or reopens the journal at `path`.
    pub fn open(path: &Path) -> FsResult<Self> {
        Ok(Self {
            path: path.to_path_buf(),
            backend: Arc::new(FileBackend::open(path)?),
        })
    }

    /// Journal held in memory, for tests.
    #[cfg(test)]
    pub(crate) fn in_memory() -> Self {
        Self {
            path: PathBuf::new(),
            backend: Arc::new(tsfs_storage::InMemoryBackend::new()),
        }
    }

    /// Location of the journal file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&self, kind: JournalRecordType, payload: &[u8]) -> FsResult<u64> {
        let len = u32::try_from(payload.len())
            .map_err(|_| StorageFault::invalid_operation("journal record payload too large"))?;
        let mut data = Vec::with_capacity(HEADER_SIZE + payload.len() + CRC_SIZE);
        data.extend_from_slice(&JOURNAL_MAGIC);
        data.extend_from_slice(&JOURNAL_VERSION.to_le_bytes());
        data.push(kind as u8);
        data.extend_from_slice(&len.to_le_bytes());
        data.extend_from_slice(payload);
        let crc = compute_crc32(&data);
        data.extend_from_slice(&crc.to_le_bytes());
        Ok(self.backend.append(&data)?)
    }

    /// Appends raw bytes and returns the journal offset they start at.
    pub fn append_data(&self, bytes: &[u8]) -> FsResult<u64> {
        let offset = self.append(JournalRecordType::Data, bytes)?;
        Ok(offset + HEADER_SIZE as u64)
    }

    /// Appends a file plan.
    pub fn append_plan(&self, plan: &FilePlan) -> FsResult<()> {
        self.append(JournalRecordType::Plan, &plan.encode()?)?;
        Ok(())
    }

    /// Reads `len` journaled bytes at `offset` into `buf`.
    pub fn read_into(&self, offset: u64, buf: &mut [u8]) -> FsResult<()> {
        Ok(self.backend.read_into(offset, buf)?)
    }

    /// Forces the journal to disk.
    pub fn sync(&self) -> FsResult<()> {
        Ok(self.backend.sync()?)
    }

    /// Current length in bytes.
    pub fn len(&self) -> FsResult<u64> {
        Ok(self.backend.size()?)
    }

    /// Returns true if nothing was journaled.
    pub fn is_empty(&self) -> FsResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Scans the journal, returning its plans.
    ///
    /// Scanning stops at the first torn or corrupt record. Plans that refer
    /// to bytes outside the intact prefix are rejected.
    pub fn scan(&self) -> FsResult<JournalScan> {
        let size = self.backend.size()?;
        let mut offset = 0u64;
        let mut data_records = HashSet::new();
        let mut plans = Vec::new();
        let mut torn = false;
        while offset < size {
            if size - offset < (HEADER_SIZE + CRC_SIZE) as u64 {
                torn = true;
                break;
            }
            let header = self.backend.read_at(offset, HEADER_SIZE)?;
            if header[0..4] != JOURNAL_MAGIC {
                torn = true;
                break;
            }
            let version = u16::from_le_bytes([header[4], header[5]]);
            if version != JOURNAL_VERSION {
                return Err(StorageFault::invalid_format(format!(
                    "journal version {version} is not supported"
                )));
            }
            let len = u32::from_le_bytes([header[7], header[8], header[9], header[10]]) as u64;
            let total = HEADER_SIZE as u64 + len + CRC_SIZE as u64;
            if size - offset < total {
                torn = true;
                break;
            }
            let record = self.backend.read_at(offset, total as usize)?;
            let body = &record[..record.len() - CRC_SIZE];
            let mut stored = [0u8; CRC_SIZE];
            stored.copy_from_slice(&record[record.len() - CRC_SIZE..]);
            if compute_crc32(body) != u32::from_le_bytes(stored) {
                torn = true;
                break;
            }
            let payload = &body[HEADER_SIZE..];
            match JournalRecordType::from_byte(header[6]) {
                Some(JournalRecordType::Data) => {
                    data_records.insert((offset + HEADER_SIZE as u64, len));
                }
                Some(JournalRecordType::Plan) => plans.push(FilePlan::decode(payload)?),
                None => {
                    return Err(StorageFault::corrupted(format!(
                        "unknown journal record type {}",
                        header[6]
                    )))
                }
            }
            offset += total;
        }
        for plan in &plans {
            for w in &plan.writes {
                let inside = data_records.iter().any(|&(start, len)| {
                    w.journal_offset >= start && w.journal_offset + w.len <= start + len
                });
                if !inside {
                    return Err(StorageFault::corrupted(format!(
                        "plan for {} refers to missing journal bytes at {}",
                        plan.id, w.journal_offset
                    )));
                }
            }
        }
        Ok(JournalScan { plans, torn })
    }
}

/// Result of [`Journal::scan`].
#[derive(Debug)]
pub struct JournalScan {
    /// Plans in the journal, in append order.
    pub plans: Vec<FilePlan>,
    /// The journal ended with a torn or corrupt record.
    pub torn: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::FileMetadata;
    use crate::types::DataType;
    use tempfile::tempdir;

    fn plan(journal_offset: u64) -> FilePlan {
        FilePlan {
            kind: FileKind::TimeSeries,
            id: FsId::new("/a/b").unwrap(),
            file_id: 3,
            new_file: true,
            truncate: false,
            deleted: false,
            writes: vec![PlanWrite {
                file_offset: 40,
                journal_offset,
                len: 4,
            }],
            metadata: Some(StoredMetadata::Series(FileMetadata::new(DataType::Int))),
        }
    }

    #[test]
    fn data_and_plans_round_trip() {
        let journal = Journal::in_memory();
        let offset = journal.append_data(b"wxyz").unwrap();
        journal.append_plan(&plan(offset)).unwrap();

        let mut buf = [0u8; 4];
        journal.read_into(offset, &mut buf).unwrap();
        assert_eq!(&buf, b"wxyz");

        let scan = journal.scan().unwrap();
        assert!(!scan.torn);
        assert_eq!(scan.plans, vec![plan(offset)]);
    }

    #[test]
    fn torn_tail_is_reported() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("t.journal");
        {
            let journal = Journal::open(&path).unwrap();
            let offset = journal.append_data(b"1234").unwrap();
            journal.append_plan(&plan(offset)).unwrap();
            journal.sync().unwrap();
        }
        let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        let len = file.metadata().unwrap().len();
        file.set_len(len - 3).unwrap();

        let scan = Journal::open(&path).unwrap().scan().unwrap();
        assert!(scan.torn);
        assert!(scan.plans.is_empty());
    }

    #[test]
    fn plan_pointing_past_data_is_corruption() {
        let journal = Journal::in_memory();
        journal.append_data(b"ab").unwrap();
        journal.append_plan(&plan(1000)).unwrap();
        assert!(matches!(
            journal.scan(),
            Err(StorageFault::Corrupted { .. })
        ));
    }
}
