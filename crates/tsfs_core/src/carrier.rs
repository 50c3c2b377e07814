//! Transfer objects for reads and writes.
//!
//! A [`TimeSeriesCarrier`] addresses its data by cadence; the file layer
//! converts cadence intervals to byte intervals with the element width of
//! the carrier's [`DataType`].

use crate::codec::ByteReader;
use crate::error::{FsResult, StorageFault};
use crate::fsid::FsId;
use crate::interval::{Interval, IntervalSet, SimpleInterval, TaggedInterval};
use crate::types::DataType;
use serde::Serialize;

/// Time series data over `[start_cadence, end_cadence]`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimeSeriesCarrier {
    /// Item identifier.
    pub id: FsId,
    /// Element type.
    pub data_type: DataType,
    /// First cadence covered by `data`.
    pub start_cadence: i64,
    /// Last cadence covered by `data`.
    pub end_cadence: i64,
    /// Element bytes, little endian, one element per cadence.
    #[serde(skip)]
    pub data: Vec<u8>,
    /// Cadences holding real data.
    pub valid: IntervalSet<SimpleInterval>,
    /// Originator of each valid cadence.
    pub origins: IntervalSet<TaggedInterval>,
    /// False when read from an identifier that has no data.
    pub exists: bool,
}

impl TimeSeriesCarrier {
    /// Creates a carrier and checks its invariants.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInterval` for inverted or negative bounds and for
    /// intervals outside the carrier range, and `InvalidOperation` when the
    /// buffer length or origin coverage disagree with the intervals.
    pub fn new(
        id: FsId,
        data_type: DataType,
        start_cadence: i64,
        end_cadence: i64,
        data: Vec<u8>,
        valid: IntervalSet<SimpleInterval>,
        origins: IntervalSet<TaggedInterval>,
    ) -> FsResult<Self> {
        let carrier = Self {
            id,
            data_type,
            start_cadence,
            end_cadence,
            data,
            valid,
            origins,
            exists: true,
        };
        carrier.validate()?;
        Ok(carrier)
    }

    /// Carrier of `values` starting at `start`, all valid and tagged `origin`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInterval` for an empty slice or a negative start.
    pub fn from_floats(id: FsId, start: i64, values: &[f32], origin: u64) -> FsResult<Self> {
        let data = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self::filled(id, DataType::Float, start, values.len(), data, origin)
    }

    /// Carrier of doubles, all valid and tagged `origin`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInterval` for an empty slice or a negative start.
    pub fn from_doubles(id: FsId, start: i64, values: &[f64], origin: u64) -> FsResult<Self> {
        let data = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self::filled(id, DataType::Double, start, values.len(), data, origin)
    }

    /// Carrier of ints, all valid and tagged `origin`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInterval` for an empty slice or a negative start.
    pub fn from_ints(id: FsId, start: i64, values: &[i32], origin: u64) -> FsResult<Self> {
        let data = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self::filled(id, DataType::Int, start, values.len(), data, origin)
    }

    fn filled(
        id: FsId,
        data_type: DataType,
        start: i64,
        count: usize,
        data: Vec<u8>,
        origin: u64,
    ) -> FsResult<Self> {
        let end = start.saturating_add(count as i64).saturating_sub(1);
        if count == 0 {
            return Err(StorageFault::InvalidInterval { start, end });
        }
        let mut valid = IntervalSet::new();
        valid.merge(SimpleInterval::new(start, end));
        let mut origins = IntervalSet::new();
        origins.merge(TaggedInterval::new(start, end, origin));
        Self::new(id, data_type, start, end, data, valid, origins)
    }

    /// Carrier with no valid cadences, used for reads of missing data.
    #[must_use]
    pub fn empty(id: FsId, data_type: DataType, start: i64, end: i64, exists: bool) -> Self {
        let len = if end >= start {
            ((end - start + 1) as u64 * data_type.width()) as usize
        } else {
            0
        };
        Self {
            id,
            data_type,
            start_cadence: start,
            end_cadence: end,
            data: vec![0; len],
            valid: IntervalSet::new(),
            origins: IntervalSet::new(),
            exists,
        }
    }

    /// Number of cadences covered by the buffer.
    #[must_use]
    pub fn cadence_count(&self) -> u64 {
        (self.end_cadence - self.start_cadence + 1) as u64
    }

    /// Checks bounds, buffer length and origin coverage.
    ///
    /// # Errors
    ///
    /// See [`TimeSeriesCarrier::new`].
    pub fn validate(&self) -> FsResult<()> {
        check_bounds(self.start_cadence, self.end_cadence)?;
        let expected = self.cadence_count() * self.data_type.width();
        if self.data.len() as u64 != expected {
            return Err(StorageFault::invalid_operation(format!(
                "{}: buffer holds {} bytes, range needs {expected}",
                self.id,
                self.data.len()
            )));
        }
        for iv in self.valid.iter() {
            check_bounds(iv.start, iv.end)?;
            if iv.start < self.start_cadence || iv.end > self.end_cadence {
                return Err(StorageFault::InvalidInterval {
                    start: iv.start,
                    end: iv.end,
                });
            }
        }
        for iv in self.origins.iter() {
            check_bounds(iv.start, iv.end)?;
        }
        if self.origins.untagged() != self.valid {
            return Err(StorageFault::invalid_operation(format!(
                "{}: origin intervals do not cover the valid intervals",
                self.id
            )));
        }
        Ok(())
    }

    /// Bytes of one cadence, if inside the buffer.
    #[must_use]
    pub fn element(&self, cadence: i64) -> Option<&[u8]> {
        if cadence < self.start_cadence || cadence > self.end_cadence {
            return None;
        }
        let w = self.data_type.width() as usize;
        let off = (cadence - self.start_cadence) as usize * w;
        self.data.get(off..off + w)
    }

    /// Decodes the buffer as floats.
    #[must_use]
    pub fn floats(&self) -> Vec<f32> {
        self.data
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    /// Decodes the buffer as ints.
    #[must_use]
    pub fn ints(&self) -> Vec<i32> {
        self.data
            .chunks_exact(4)
            .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    /// Decodes the buffer as doubles.
    #[must_use]
    pub fn doubles(&self) -> Vec<f64> {
        self.data
            .chunks_exact(8)
            .map(|c| {
                let mut b = [0u8; 8];
                b.copy_from_slice(c);
                f64::from_le_bytes(b)
            })
            .collect()
    }
}

/// Largest cadence whose byte offsets fit an `i64` at every element width.
pub const MAX_CADENCE: i64 = i64::MAX / 8 - 1;

/// Rejects inverted and negative intervals and cadences past
/// [`MAX_CADENCE`].
pub(crate) fn check_bounds(start: i64, end: i64) -> FsResult<()> {
    if start < 0 || end < start || end > MAX_CADENCE {
        return Err(StorageFault::InvalidInterval { start, end });
    }
    Ok(())
}

/// Cadence interval to the byte interval it occupies.
pub(crate) fn to_bytes<I: Interval>(iv: &I, width: u64) -> I {
    let w = width as i64;
    iv.with_bounds(iv.start() * w, (iv.end() + 1) * w - 1)
}

/// Byte interval back to cadences. Byte lists are always width aligned.
pub(crate) fn to_cadences<I: Interval>(iv: &I, width: u64) -> I {
    let w = width as i64;
    iv.with_bounds(iv.start() / w, (iv.end() + 1) / w - 1)
}

/// Converts a whole list between axes.
pub(crate) fn map_set<I: Interval>(set: &IntervalSet<I>, f: impl Fn(&I) -> I) -> IntervalSet<I> {
    IntervalSet::from_intervals(set.iter().map(f))
}

/// Opaque stream content with its originator.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BlobCarrier {
    /// Item identifier.
    pub id: FsId,
    /// Originator of the content.
    pub origin: u64,
    /// Stream bytes.
    #[serde(skip)]
    pub data: Vec<u8>,
    /// False when read from an identifier that has no data.
    pub exists: bool,
}

/// Size of an encoded [`MjdPoint`].
pub const MJD_POINT_SIZE: usize = 20;

/// One sample of an MJD-keyed series.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MjdPoint {
    /// Modified Julian date.
    pub mjd: f64,
    /// Sample value.
    pub value: f32,
    /// Originator tag.
    pub originator: u64,
}

impl MjdPoint {
    /// Creates a point.
    #[must_use]
    pub const fn new(mjd: f64, value: f32, originator: u64) -> Self {
        Self {
            mjd,
            value,
            originator,
        }
    }
}

/// Points of an MJD series inside `[start_mjd, end_mjd]`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MjdTimeSeries {
    /// Item identifier.
    pub id: FsId,
    /// Lower bound of the range, inclusive.
    pub start_mjd: f64,
    /// Upper bound of the range, inclusive.
    pub end_mjd: f64,
    /// Points sorted by date.
    pub points: Vec<MjdPoint>,
    /// False when read from an identifier that has no data.
    pub exists: bool,
}

impl MjdTimeSeries {
    /// Creates a series and checks it.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` if the range is inverted or not finite, or
    /// if the points are unsorted or outside the range.
    pub fn new(id: FsId, start_mjd: f64, end_mjd: f64, points: Vec<MjdPoint>) -> FsResult<Self> {
        let series = Self {
            id,
            start_mjd,
            end_mjd,
            points,
            exists: true,
        };
        series.validate()?;
        Ok(series)
    }

    /// Checks the range and the points.
    ///
    /// # Errors
    ///
    /// See [`MjdTimeSeries::new`].
    pub fn validate(&self) -> FsResult<()> {
        if !self.start_mjd.is_finite() || !self.end_mjd.is_finite() || self.start_mjd > self.end_mjd
        {
            return Err(StorageFault::invalid_operation(format!(
                "{}: bad mjd range [{}, {}]",
                self.id, self.start_mjd, self.end_mjd
            )));
        }
        if self
            .points
            .iter()
            .any(|p| p.mjd < self.start_mjd || p.mjd > self.end_mjd)
        {
            return Err(StorageFault::invalid_operation(format!(
                "{}: point outside [{}, {}]",
                self.id, self.start_mjd, self.end_mjd
            )));
        }
        if self.points.windows(2).any(|w| w[0].mjd >= w[1].mjd) {
            return Err(StorageFault::invalid_operation(format!(
                "{}: points must be strictly ascending by mjd",
                self.id
            )));
        }
        Ok(())
    }
}

/// Encodes points as fixed-size little-endian records.
pub(crate) fn encode_points(points: &[MjdPoint]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(points.len() * MJD_POINT_SIZE);
    for p in points {
        buf.extend_from_slice(&p.mjd.to_le_bytes());
        buf.extend_from_slice(&p.value.to_le_bytes());
        buf.extend_from_slice(&p.originator.to_le_bytes());
    }
    buf
}

/// Decodes records written by [`encode_points`].
pub(crate) fn decode_points(buf: &[u8]) -> FsResult<Vec<MjdPoint>> {
    if buf.len() % MJD_POINT_SIZE != 0 {
        return Err(StorageFault::corrupted(format!(
            "mjd data length {} is not a multiple of {MJD_POINT_SIZE}",
            buf.len()
        )));
    }
    let mut r = ByteReader::new(buf, "mjd points");
    let mut points = Vec::with_capacity(buf.len() / MJD_POINT_SIZE);
    while r.remaining() > 0 {
        let mjd = f64::from_le_bytes(r.array()?);
        let value = f32::from_le_bytes(r.array()?);
        let originator = r.u64()?;
        points.push(MjdPoint::new(mjd, value, originator));
    }
    Ok(points)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id() -> FsId {
        FsId::new("/t/s").unwrap()
    }

    #[test]
    fn float_carrier_is_fully_valid() {
        let c = TimeSeriesCarrier::from_floats(id(), 10, &[1.0, 2.0, 3.0], 7).unwrap();
        assert_eq!((c.start_cadence, c.end_cadence), (10, 12));
        assert_eq!(c.valid.as_slice(), [SimpleInterval::new(10, 12)]);
        assert_eq!(c.origins.as_slice(), [TaggedInterval::new(10, 12, 7)]);
        assert_eq!(c.floats(), [1.0, 2.0, 3.0]);
        assert_eq!(c.element(11), Some(&2.0f32.to_le_bytes()[..]));
        assert_eq!(c.element(13), None);
    }

    #[test]
    fn rejects_bad_bounds() {
        assert!(matches!(
            TimeSeriesCarrier::from_ints(id(), -1, &[1], 0),
            Err(StorageFault::InvalidInterval { .. })
        ));
        assert!(TimeSeriesCarrier::from_ints(id(), 0, &[], 0).is_err());
    }

    #[test]
    fn rejects_cadences_past_the_byte_axis() {
        assert!(check_bounds(0, MAX_CADENCE).is_ok());
        assert!(matches!(
            check_bounds(0, i64::MAX / 2),
            Err(StorageFault::InvalidInterval { .. })
        ));
        assert!(matches!(
            TimeSeriesCarrier::from_ints(id(), i64::MAX - 1, &[1, 2, 3], 0),
            Err(StorageFault::InvalidInterval { .. })
        ));
        assert!(matches!(
            TimeSeriesCarrier::from_doubles(id(), MAX_CADENCE, &[1.0, 2.0], 0),
            Err(StorageFault::InvalidInterval { .. })
        ));
    }

    #[test]
    fn rejects_mismatched_origins() {
        let valid = IntervalSet::from_intervals([SimpleInterval::new(0, 3)]);
        let origins = IntervalSet::from_intervals([TaggedInterval::new(0, 2, 1)]);
        let err =
            TimeSeriesCarrier::new(id(), DataType::Int, 0, 3, vec![0; 16], valid, origins);
        assert!(matches!(err, Err(StorageFault::InvalidOperation { .. })));
    }

    #[test]
    fn rejects_valid_outside_range() {
        let valid = IntervalSet::from_intervals([SimpleInterval::new(0, 9)]);
        let origins = IntervalSet::from_intervals([TaggedInterval::new(0, 9, 1)]);
        let err =
            TimeSeriesCarrier::new(id(), DataType::Int, 0, 3, vec![0; 16], valid, origins);
        assert!(matches!(err, Err(StorageFault::InvalidInterval { .. })));
    }

    #[test]
    fn axis_conversion() {
        let iv = SimpleInterval::new(3, 5);
        let bytes = to_bytes(&iv, 8);
        assert_eq!(bytes, SimpleInterval::new(24, 47));
        assert_eq!(to_cadences(&bytes, 8), iv);
    }

    #[test]
    fn empty_carrier_sized_for_range() {
        let c = TimeSeriesCarrier::empty(id(), DataType::Double, 0, 9, false);
        assert_eq!(c.data.len(), 80);
        assert!(!c.exists);
        assert!(c.valid.is_empty());
    }

    #[test]
    fn mjd_points_encode() {
        let points = vec![MjdPoint::new(55000.5, 1.5, 3), MjdPoint::new(55001.0, -2.0, 4)];
        let buf = encode_points(&points);
        assert_eq!(buf.len(), 2 * MJD_POINT_SIZE);
        assert_eq!(decode_points(&buf).unwrap(), points);
        assert!(decode_points(&buf[..7]).is_err());
    }

    #[test]
    fn mjd_series_validation() {
        let p = |m| MjdPoint::new(m, 0.0, 0);
        assert!(MjdTimeSeries::new(id(), 1.0, 5.0, vec![p(1.0), p(5.0)]).is_ok());
        assert!(MjdTimeSeries::new(id(), 5.0, 1.0, vec![]).is_err());
        assert!(MjdTimeSeries::new(id(), 1.0, 5.0, vec![p(3.0), p(2.0)]).is_err());
        assert!(MjdTimeSeries::new(id(), 1.0, 5.0, vec![p(6.0)]).is_err());
    }
}
