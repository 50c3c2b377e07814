//! MJD series files: fixed-size points sorted by date.

use super::{FileContext, FileIo};
use crate::carrier::{decode_points, encode_points, MjdPoint, MjdTimeSeries, MJD_POINT_SIZE};
use crate::error::{try_alloc_buffer, FsResult, StorageFault};
use crate::metadata::StoredMetadata;

impl FileContext {
    fn mjd_points(&self, io: &FileIo<'_>) -> FsResult<Option<Vec<MjdPoint>>> {
        let points = match &self.meta {
            None => return Ok(None),
            Some(StoredMetadata::Mjd { points }) => *points,
            Some(other) => {
                return Err(StorageFault::corrupted(format!(
                    "{} holds {} metadata, expected an mjd series",
                    self.id,
                    other.kind()
                )))
            }
        };
        let len = usize::try_from(points)
            .ok()
            .and_then(|p| p.checked_mul(MJD_POINT_SIZE))
            .ok_or(StorageFault::OutOfMemory {
                requested: usize::MAX,
            })?;
        let mut buf = try_alloc_buffer(len, 0)?;
        self.read_bytes(io, 0, &mut buf)?;
        decode_points(&buf).map(Some)
    }

    /// Points within `[start_mjd, end_mjd]`, `None` if the series does not exist.
    pub(crate) fn read_mjd(
        &self,
        io: &FileIo<'_>,
        start_mjd: f64,
        end_mjd: f64,
    ) -> FsResult<Option<MjdTimeSeries>> {
        let Some(points) = self.mjd_points(io)? else {
            return Ok(None);
        };
        let points = points
            .into_iter()
            .filter(|p| p.mjd >= start_mjd && p.mjd <= end_mjd)
            .collect();
        MjdTimeSeries::new(self.id.clone(), start_mjd, end_mjd, points).map(Some)
    }

    /// Replaces the points inside the series range with the series' points.
    pub(crate) fn write_mjd(&mut self, io: &FileIo<'_>, series: &MjdTimeSeries) -> FsResult<()> {
        series.validate()?;
        let mut points: Vec<MjdPoint> = self
            .mjd_points(io)?
            .unwrap_or_default()
            .into_iter()
            .filter(|p| p.mjd < series.start_mjd || p.mjd > series.end_mjd)
            .collect();
        points.extend_from_slice(&series.points);
        points.sort_by(|a, b| a.mjd.total_cmp(&b.mjd));

        self.ensure_file_id(io.store)?;
        self.begin_rewrite();
        self.journal_write(io, 0, &encode_points(&points))?;
        self.meta = Some(StoredMetadata::Mjd {
            points: points.len() as u64,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::Fixture;
    use super::*;
    use crate::fsid::FsId;
    use crate::types::FileKind;

    fn series(start: f64, end: f64, mjds: &[f64], tag: u64) -> MjdTimeSeries {
        let points = mjds.iter().map(|&m| MjdPoint::new(m, m as f32, tag)).collect();
        MjdTimeSeries::new(FsId::new("/mjd").unwrap(), start, end, points).unwrap()
    }

    #[test]
    fn write_replaces_only_its_range() {
        let mut fx = Fixture::new();
        let io = fx.io(4096);
        let mut c = FileContext::open(&fx.store, FileKind::Mjd, FsId::new("/mjd").unwrap()).unwrap();
        assert!(c.read_mjd(&io, 0.0, 1.0).unwrap().is_none());
        c.write_mjd(&io, &series(50000.0, 50010.0, &[50000.0, 50005.0, 50010.0], 1))
            .unwrap();
        fx.commit(c);

        fx.fresh_slot("mjd2.journal");
        let io = fx.io(4096);
        let mut c = FileContext::open(&fx.store, FileKind::Mjd, FsId::new("/mjd").unwrap()).unwrap();
        c.write_mjd(&io, &series(50004.0, 50006.0, &[50004.5], 2))
            .unwrap();
        let all = c.read_mjd(&io, 0.0, 1e6).unwrap().unwrap();
        let got: Vec<(f64, u64)> = all.points.iter().map(|p| (p.mjd, p.originator)).collect();
        assert_eq!(got, vec![(50000.0, 1), (50004.5, 2), (50010.0, 1)]);

        let part = c.read_mjd(&io, 50001.0, 50009.0).unwrap().unwrap();
        assert_eq!(part.points.len(), 1);
    }
}
