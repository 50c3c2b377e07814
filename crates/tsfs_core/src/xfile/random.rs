//! Random-access time series files.
//!
//! Metadata is kept in bytes. Carriers speak cadences, so every operation
//! converts with the element width of the file's data type.

use super::{FileContext, FileIo};
use crate::carrier::{check_bounds, map_set, to_bytes, to_cadences, TimeSeriesCarrier};
use crate::error::{try_alloc_buffer, FsResult, StorageFault};
use crate::interval::{IntervalSet, SimpleInterval, TaggedInterval};
use crate::merge::{IoChunk, TimeSeriesIntervalIterator, TimeSeriesMergeIntervalIterator};
use crate::metadata::{FileMetadata, StoredMetadata};
use crate::types::{DataType, FileKind};

/// Valid and origin cadences of a series.
#[derive(Debug, Clone, PartialEq)]
pub struct CadenceIntervals {
    /// Element type.
    pub data_type: DataType,
    /// Cadences holding data.
    pub valid: IntervalSet<SimpleInterval>,
    /// Originator of each valid cadence range.
    pub origins: IntervalSet<TaggedInterval>,
}

impl FileContext {
    fn series_meta(&self) -> FsResult<Option<&FileMetadata>> {
        match &self.meta {
            None => Ok(None),
            Some(StoredMetadata::Series(m)) => Ok(Some(m)),
            Some(other) => Err(StorageFault::corrupted(format!(
                "{} holds {} metadata, expected a time series",
                self.id,
                other.kind()
            ))),
        }
    }

    fn check_type(&self, stored: Option<DataType>, expected: DataType) -> FsResult<()> {
        match stored {
            Some(found) if found != expected => Err(StorageFault::TypeMismatch {
                id: self.id.clone(),
                expected,
                found,
            }),
            _ => Ok(()),
        }
    }

    /// Reads `[start, end]` in cadences.
    ///
    /// Returns `None` if the series does not exist. Cadences without data
    /// read as zero bytes and are absent from the valid list.
    pub(crate) fn read_series(
        &self,
        io: &FileIo<'_>,
        expected: Option<DataType>,
        start: i64,
        end: i64,
    ) -> FsResult<Option<TimeSeriesCarrier>> {
        debug_assert_eq!(self.kind, FileKind::TimeSeries);
        check_bounds(start, end)?;
        let Some(meta) = self.series_meta()? else {
            return Ok(None);
        };
        if let Some(expected) = expected {
            self.check_type(meta.data_type, expected)?;
        }
        let data_type = meta
            .data_type
            .or(expected)
            .ok_or_else(|| StorageFault::corrupted(format!("{} has no data type", self.id)))?;
        let width = data_type.width();
        let first = start * width as i64;
        let last = (end + 1) * width as i64 - 1;
        let mut data = try_alloc_buffer((last - first + 1) as usize, 0)?;

        let valid = meta.valid.clipped(first, last);
        for chunk in TimeSeriesIntervalIterator::new(valid.as_slice(), io.gap_threshold) {
            let lo = (chunk.start - first) as usize;
            let hi = (chunk.end - first) as usize + 1;
            self.read_bytes(io, chunk.start as u64, &mut data[lo..hi])?;
            zero_gaps(&mut data[lo..hi], &chunk);
        }

        Ok(Some(TimeSeriesCarrier {
            id: self.id.clone(),
            data_type,
            start_cadence: start,
            end_cadence: end,
            data,
            valid: map_set(&valid, |iv| to_cadences(iv, width)),
            origins: map_set(&meta.origins.clipped(first, last), |iv| {
                to_cadences(iv, width)
            }),
            exists: true,
        }))
    }

    /// Writes a carrier, overwriting `[start, end]` or merging into it.
    pub(crate) fn write_series(
        &mut self,
        io: &FileIo<'_>,
        carrier: &TimeSeriesCarrier,
        overwrite: bool,
    ) -> FsResult<()> {
        carrier.validate()?;
        let mut meta = match self.series_meta()? {
            Some(m) => {
                self.check_type(m.data_type, carrier.data_type)?;
                m.clone()
            }
            None => FileMetadata::new(carrier.data_type),
        };
        if meta.data_type.is_none() {
            meta.data_type = Some(carrier.data_type);
        }
        if self.meta.is_none() && self.deleted {
            self.begin_rewrite();
        }
        self.ensure_file_id(io.store)?;

        let width = carrier.data_type.width();
        let first = carrier.start_cadence * width as i64;
        let last = (carrier.end_cadence + 1) * width as i64 - 1;
        let valid = map_set(&carrier.valid, |iv| to_bytes(iv, width));
        let origins = map_set(&carrier.origins, |iv| to_bytes(iv, width));

        let chunks: Vec<IoChunk> = if overwrite {
            meta.valid.delete_interval(first, last);
            meta.origins.delete_interval(first, last);
            TimeSeriesIntervalIterator::new(valid.as_slice(), io.gap_threshold).collect()
        } else {
            TimeSeriesMergeIntervalIterator::new(
                valid.as_slice(),
                meta.valid.as_slice(),
                io.gap_threshold,
            )
            .collect()
        };
        for chunk in &chunks {
            let lo = (chunk.start - first) as usize;
            let hi = (chunk.end - first) as usize + 1;
            self.journal_write(io, chunk.start as u64, &carrier.data[lo..hi])?;
        }
        for iv in valid.iter() {
            meta.valid.merge(*iv);
        }
        for iv in origins.iter() {
            meta.origins.merge(*iv);
        }
        self.meta = Some(StoredMetadata::Series(meta));
        self.dirty = true;
        Ok(())
    }

    /// Removes `[start, end]` cadences from the valid and origin lists.
    ///
    /// Returns false if the series does not exist.
    pub(crate) fn delete_series_interval(&mut self, start: i64, end: i64) -> FsResult<bool> {
        check_bounds(start, end)?;
        let Some(meta) = self.series_meta()? else {
            return Ok(false);
        };
        let mut meta = meta.clone();
        let width = meta.data_type.map_or(1, DataType::width) as i64;
        meta.valid.delete_interval(start * width, (end + 1) * width - 1);
        meta.origins.delete_interval(start * width, (end + 1) * width - 1);
        self.meta = Some(StoredMetadata::Series(meta));
        self.dirty = true;
        Ok(true)
    }

    /// Valid and origin cadences, `None` if the series does not exist.
    pub(crate) fn cadence_intervals(&self) -> FsResult<Option<CadenceIntervals>> {
        let Some(meta) = self.series_meta()? else {
            return Ok(None);
        };
        let Some(data_type) = meta.data_type else {
            return Ok(None);
        };
        let width = data_type.width();
        Ok(Some(CadenceIntervals {
            data_type,
            valid: map_set(&meta.valid, |iv| to_cadences(iv, width)),
            origins: map_set(&meta.origins, |iv| to_cadences(iv, width)),
        }))
    }
}

/// Clears the bytes of `buf` that lie between the chunk's intervals.
fn zero_gaps(buf: &mut [u8], chunk: &IoChunk) {
    let mut pos = chunk.start;
    for iv in &chunk.intervals {
        if iv.start > pos {
            let lo = (pos - chunk.start) as usize;
            let hi = (iv.start - chunk.start) as usize;
            buf[lo..hi].fill(0);
        }
        pos = iv.end + 1;
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::Fixture;
    use super::*;
    use crate::fsid::FsId;

    fn ctx(fx: &Fixture, id: &str) -> FileContext {
        FileContext::open(&fx.store, FileKind::TimeSeries, FsId::new(id).unwrap()).unwrap()
    }

    fn ints(id: &str, start: i64, values: &[i32], origin: u64) -> TimeSeriesCarrier {
        TimeSeriesCarrier::from_ints(FsId::new(id).unwrap(), start, values, origin).unwrap()
    }

    fn valid(c: &TimeSeriesCarrier) -> Vec<(i64, i64)> {
        c.valid.iter().map(|iv| (iv.start, iv.end)).collect()
    }

    fn origins(c: &TimeSeriesCarrier) -> Vec<(i64, i64, u64)> {
        c.origins.iter().map(|iv| (iv.start, iv.end, iv.tag)).collect()
    }

    #[test]
    fn write_then_read_in_one_transaction() {
        let fx = Fixture::new();
        let io = fx.io(4096);
        let mut c = ctx(&fx, "/a/b");
        assert!(c.read_series(&io, None, 0, 9).unwrap().is_none());
        let values: Vec<i32> = (0..100).collect();
        c.write_series(&io, &ints("/a/b", 0, &values, 7), true)
            .unwrap();

        let read = c
            .read_series(&io, Some(DataType::Int), 0, 99)
            .unwrap()
            .unwrap();
        assert_eq!(read.ints(), values);
        assert_eq!(origins(&read), vec![(0, 99, 7)]);

        let wider = c.read_series(&io, None, 95, 104).unwrap().unwrap();
        assert_eq!(wider.ints(), vec![95, 96, 97, 98, 99, 0, 0, 0, 0, 0]);
        assert_eq!(valid(&wider), vec![(95, 99)]);
    }

    #[test]
    fn type_mismatch_on_read_and_write() {
        let fx = Fixture::new();
        let io = fx.io(4096);
        let mut c = ctx(&fx, "/t");
        c.write_series(&io, &ints("/t", 0, &[1, 2], 1), true).unwrap();
        assert!(matches!(
            c.read_series(&io, Some(DataType::Double), 0, 1),
            Err(StorageFault::TypeMismatch { .. })
        ));
        let floats = TimeSeriesCarrier::from_floats(FsId::new("/t").unwrap(), 0, &[1.0], 1).unwrap();
        assert!(matches!(
            c.write_series(&io, &floats, true),
            Err(StorageFault::TypeMismatch { .. })
        ));
    }

    #[test]
    fn overwrite_splits_origins_after_commit() {
        let mut fx = Fixture::new();
        let io = fx.io(4096);
        let mut c = ctx(&fx, "/y");
        c.write_series(&io, &ints("/y", 0, &[1; 50], 0xA), true)
            .unwrap();
        fx.commit(c);

        fx.fresh_slot("second.journal");
        let io = fx.io(4096);
        let mut c = ctx(&fx, "/y");
        c.write_series(&io, &ints("/y", 20, &[2; 10], 0xB), true)
            .unwrap();
        fx.commit(c);

        let c = ctx(&fx, "/y");
        let read = c.read_series(&io, None, 0, 49).unwrap().unwrap();
        assert_eq!(
            origins(&read),
            vec![(0, 19, 0xA), (20, 29, 0xB), (30, 49, 0xA)]
        );
        assert_eq!(valid(&read), vec![(0, 49)]);
        assert_eq!(&read.ints()[18..32], &[1, 1, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 1, 1]);
    }

    #[test]
    fn merge_keeps_disjoint_data() {
        let mut fx = Fixture::new();
        let io = fx.io(4096);
        let mut c = ctx(&fx, "/m");
        c.write_series(&io, &ints("/m", 0, &[5; 10], 1), true)
            .unwrap();
        fx.commit(c);

        fx.fresh_slot("merge.journal");
        let io = fx.io(4096);
        let mut c = ctx(&fx, "/m");
        c.write_series(&io, &ints("/m", 20, &[6; 5], 2), false)
            .unwrap();
        let read = c.read_series(&io, None, 0, 24).unwrap().unwrap();
        assert_eq!(valid(&read), vec![(0, 9), (20, 24)]);
        assert_eq!(&read.ints()[..10], &[5; 10]);
        assert_eq!(&read.ints()[10..20], &[0; 10]);
        assert_eq!(&read.ints()[20..], &[6; 5]);
    }

    #[test]
    fn merge_does_not_erase_obstructing_data() {
        let mut fx = Fixture::new();
        let io = fx.io(4096);
        let mut c = ctx(&fx, "/o");
        c.write_series(&io, &ints("/o", 5, &[9; 2], 1), true)
            .unwrap();
        fx.commit(c);

        fx.fresh_slot("obstructed.journal");
        let io = fx.io(4096);
        let mut c = ctx(&fx, "/o");
        let mut carrier = ints("/o", 0, &[3; 12], 2);
        carrier.valid = IntervalSet::from_intervals([
            SimpleInterval::new(0, 2),
            SimpleInterval::new(9, 11),
        ]);
        carrier.origins = IntervalSet::from_intervals([
            TaggedInterval::new(0, 2, 2),
            TaggedInterval::new(9, 11, 2),
        ]);
        c.write_series(&io, &carrier, false).unwrap();
        fx.commit(c);

        let c = ctx(&fx, "/o");
        let read = c.read_series(&io, None, 0, 11).unwrap().unwrap();
        assert_eq!(valid(&read), vec![(0, 2), (5, 6), (9, 11)]);
        assert_eq!(
            read.ints(),
            vec![3, 3, 3, 0, 0, 9, 9, 0, 0, 3, 3, 3]
        );
    }

    #[test]
    fn delete_interval_and_cadence_intervals() {
        let fx = Fixture::new();
        let io = fx.io(4096);
        let mut c = ctx(&fx, "/d");
        assert!(!c.delete_series_interval(0, 1).unwrap());
        c.write_series(&io, &ints("/d", 0, &[1; 10], 4), true)
            .unwrap();
        assert!(c.delete_series_interval(3, 5).unwrap());
        let iv = c.cadence_intervals().unwrap().unwrap();
        assert_eq!(iv.data_type, DataType::Int);
        assert_eq!(
            iv.valid.iter().map(|i| (i.start, i.end)).collect::<Vec<_>>(),
            vec![(0, 2), (6, 9)]
        );
        assert!(matches!(
            c.delete_series_interval(5, 3),
            Err(StorageFault::InvalidInterval { .. })
        ));
    }

    #[test]
    fn huge_cadences_are_rejected_not_overflowed() {
        let fx = Fixture::new();
        let io = fx.io(4096);
        let mut c = ctx(&fx, "/h");
        c.write_series(&io, &ints("/h", 0, &[1, 2], 1), true).unwrap();
        fx.commit(c);

        let mut c = ctx(&fx, "/h");
        assert!(matches!(
            c.read_series(&io, Some(DataType::Int), 0, i64::MAX / 2),
            Err(StorageFault::InvalidInterval { .. })
        ));
        assert!(matches!(
            c.delete_series_interval(i64::MAX / 4, i64::MAX - 1),
            Err(StorageFault::InvalidInterval { .. })
        ));
        assert_eq!(c.read_series(&io, None, 0, 1).unwrap().unwrap().ints(), vec![1, 2]);
    }
}
