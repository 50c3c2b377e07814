//! Per-file metadata and its `.meta` sidecar encoding.

use crate::error::{FsResult, StorageFault};
use crate::interval::{IntervalSet, SimpleInterval, TaggedInterval};
use crate::types::{DataType, FileKind};
use serde::{Deserialize, Serialize};

/// Valid and origin intervals of a random-access file, in bytes.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FileMetadata {
    /// Element type, fixed by the first write.
    pub data_type: Option<DataType>,
    /// Byte ranges holding data.
    pub valid: IntervalSet<SimpleInterval>,
    /// Originator of each valid byte range.
    pub origins: IntervalSet<TaggedInterval>,
}

impl FileMetadata {
    /// Metadata of a new file of `data_type`.
    #[must_use]
    pub fn new(data_type: DataType) -> Self {
        Self {
            data_type: Some(data_type),
            ..Self::default()
        }
    }

    /// One past the last valid byte.
    #[must_use]
    pub fn data_end(&self) -> u64 {
        self.valid.bounds().map_or(0, |(_, end)| (end + 1) as u64)
    }
}

/// Sidecar content, one variant per file kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StoredMetadata {
    /// Random-access time series.
    Series(FileMetadata),
    /// Stream file.
    Blob {
        /// Originator of the content.
        origin: u64,
        /// Content length in bytes.
        len: u64,
    },
    /// MJD series.
    Mjd {
        /// Number of points in the data file.
        points: u64,
    },
}

impl StoredMetadata {
    /// Kind of file this metadata belongs to.
    #[must_use]
    pub fn kind(&self) -> FileKind {
        match self {
            Self::Series(_) => FileKind::TimeSeries,
            Self::Blob { .. } => FileKind::Blob,
            Self::Mjd { .. } => FileKind::Mjd,
        }
    }

    /// Bytes the data file must hold at least.
    #[must_use]
    pub fn expected_data_len(&self) -> u64 {
        match self {
            Self::Series(m) => m.data_end(),
            Self::Blob { len, .. } => *len,
            Self::Mjd { points } => points * crate::carrier::MJD_POINT_SIZE as u64,
        }
    }

    /// CBOR encoding.
    pub fn encode(&self) -> FsResult<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf)
            .map_err(|e| StorageFault::invalid_format(format!("metadata encode: {e}")))?;
        Ok(buf)
    }

    /// Decodes and checks interval invariants.
    pub fn decode(bytes: &[u8]) -> FsResult<Self> {
        let meta: Self = ciborium::from_reader(bytes)
            .map_err(|e| StorageFault::corrupted(format!("metadata decode: {e}")))?;
        if let Self::Series(m) = &meta {
            if !m.valid.is_well_formed() || !m.origins.is_well_formed() {
                return Err(StorageFault::corrupted("metadata intervals overlap"));
            }
        }
        Ok(meta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn series_metadata_encodes() {
        let mut m = FileMetadata::new(DataType::Float);
        m.valid.merge(SimpleInterval::new(0, 399));
        m.origins.merge(TaggedInterval::new(0, 399, 7));
        assert_eq!(m.data_end(), 400);
        let stored = StoredMetadata::Series(m);
        let decoded = StoredMetadata::decode(&stored.encode().unwrap()).unwrap();
        assert_eq!(decoded, stored);
        assert_eq!(decoded.kind(), FileKind::TimeSeries);
        assert_eq!(decoded.expected_data_len(), 400);
    }

    #[test]
    fn other_kinds() {
        let blob = StoredMetadata::Blob { origin: 3, len: 10 };
        assert_eq!(StoredMetadata::decode(&blob.encode().unwrap()).unwrap(), blob);
        assert_eq!(StoredMetadata::Mjd { points: 2 }.expected_data_len(), 40);
    }

    #[test]
    fn garbage_is_corruption() {
        assert!(matches!(
            StoredMetadata::decode(b"\xff\x00garbage"),
            Err(StorageFault::Corrupted { .. })
        ));
    }
}
