//! Inclusive intervals and sorted, non-overlapping interval lists.
//!
//! Valid-data lists use [`SimpleInterval`]; provenance lists use
//! [`TaggedInterval`]. Both are kept in an [`IntervalSet`], which maintains
//! the ordering and non-overlap invariant on every mutation.

use serde::{Deserialize, Serialize};
use std::fmt::Debug;

/// An inclusive `[start, end]` range.
pub trait Interval: Clone + Debug + PartialEq {
    /// First covered position.
    fn start(&self) -> i64;
    /// Last covered position.
    fn end(&self) -> i64;
    /// Copy of this interval with new bounds and the same payload.
    fn with_bounds(&self, start: i64, end: i64) -> Self;
    /// Whether two touching intervals may be coalesced into one.
    fn same_kind(&self, other: &Self) -> bool;

    /// Number of covered positions.
    fn len(&self) -> u64 {
        (self.end() - self.start() + 1) as u64
    }

    /// Returns true if `[start, end]` overlaps this interval.
    fn overlaps(&self, start: i64, end: i64) -> bool {
        self.start() <= end && self.end() >= start
    }
}

/// Plain inclusive range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SimpleInterval {
    /// First covered position.
    pub start: i64,
    /// Last covered position.
    pub end: i64,
}

impl SimpleInterval {
    /// Creates an interval.
    #[must_use]
    pub const fn new(start: i64, end: i64) -> Self {
        Self { start, end }
    }
}

impl Interval for SimpleInterval {
    fn start(&self) -> i64 {
        self.start
    }
    fn end(&self) -> i64 {
        self.end
    }
    fn with_bounds(&self, start: i64, end: i64) -> Self {
        Self { start, end }
    }
    fn same_kind(&self, _other: &Self) -> bool {
        true
    }
}

/// Range labelled with the originator that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaggedInterval {
    /// First covered position.
    pub start: i64,
    /// Last covered position.
    pub end: i64,
    /// Opaque originator tag.
    pub tag: u64,
}

impl TaggedInterval {
    /// Creates a tagged interval.
    #[must_use]
    pub const fn new(start: i64, end: i64, tag: u64) -> Self {
        Self { start, end, tag }
    }
}

impl Interval for TaggedInterval {
    fn start(&self) -> i64 {
        self.start
    }
    fn end(&self) -> i64 {
        self.end
    }
    fn with_bounds(&self, start: i64, end: i64) -> Self {
        Self {
            start,
            end,
            tag: self.tag,
        }
    }
    fn same_kind(&self, other: &Self) -> bool {
        self.tag == other.tag
    }
}

/// Sorted list of non-overlapping intervals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IntervalSet<I> {
    list: Vec<I>,
}

impl<I> Default for IntervalSet<I> {
    fn default() -> Self {
        Self { list: Vec::new() }
    }
}

impl<I: Interval> IntervalSet<I> {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a set by merging each interval in turn.
    pub fn from_intervals(intervals: impl IntoIterator<Item = I>) -> Self {
        let mut set = Self::new();
        for iv in intervals {
            set.merge(iv);
        }
        set
    }

    /// Intervals in ascending order.
    #[must_use]
    pub fn as_slice(&self) -> &[I] {
        &self.list
    }

    /// Iterates in ascending order.
    pub fn iter(&self) -> std::slice::Iter<'_, I> {
        self.list.iter()
    }

    /// Number of intervals.
    #[must_use]
    pub fn len(&self) -> usize {
        self.list.len()
    }

    /// Returns true if the set holds no intervals.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    /// Total number of covered positions.
    #[must_use]
    pub fn covered(&self) -> u64 {
        self.list.iter().map(Interval::len).sum()
    }

    /// Removes all intervals.
    pub fn clear(&mut self) {
        self.list.clear();
    }

    /// Returns the owned list.
    #[must_use]
    pub fn into_vec(self) -> Vec<I> {
        self.list
    }

    /// Lowest start and highest end, if any.
    #[must_use]
    pub fn bounds(&self) -> Option<(i64, i64)> {
        Some((self.list.first()?.start(), self.list.last()?.end()))
    }

    /// Removes `[start, end]`, splitting intervals that overlap it partially.
    pub fn delete_interval(&mut self, start: i64, end: i64) {
        if start > end || !self.list.iter().any(|iv| iv.overlaps(start, end)) {
            return;
        }
        let mut out = Vec::with_capacity(self.list.len() + 1);
        for iv in self.list.drain(..) {
            if !iv.overlaps(start, end) {
                out.push(iv);
                continue;
            }
            if iv.start() < start {
                out.push(iv.with_bounds(iv.start(), start - 1));
            }
            if iv.end() > end {
                out.push(iv.with_bounds(end + 1, iv.end()));
            }
        }
        self.list = out;
    }

    /// Inserts `iv`, replacing whatever it overlaps and coalescing with
    /// touching neighbours of the same kind.
    ///
    /// For simple intervals this is set union. For tagged intervals the new
    /// tag wins over the range it covers.
    pub fn merge(&mut self, iv: I) {
        self.delete_interval(iv.start(), iv.end());
        let mut idx = self.list.partition_point(|x| x.start() < iv.start());
        let mut merged = iv;

        if idx > 0 {
            let left = &self.list[idx - 1];
            if left.end() + 1 == merged.start() && left.same_kind(&merged) {
                merged = merged.with_bounds(left.start(), merged.end());
                self.list.remove(idx - 1);
                idx -= 1;
            }
        }
        if let Some(right) = self.list.get(idx) {
            if merged.end() + 1 == right.start() && right.same_kind(&merged) {
                merged = merged.with_bounds(merged.start(), right.end());
                self.list.remove(idx);
            }
        }
        self.list.insert(idx, merged);
    }

    /// Merges every interval of `other`.
    pub fn merge_all(&mut self, other: &IntervalSet<I>) {
        for iv in other.iter() {
            self.merge(iv.clone());
        }
    }

    /// Intervals overlapping `[start, end]`, clipped to it when `clip` is set.
    #[must_use]
    pub fn spanned(&self, start: i64, end: i64, clip: bool) -> Vec<I> {
        let first = self.list.partition_point(|x| x.end() < start);
        self.list[first..]
            .iter()
            .take_while(|iv| iv.start() <= end)
            .map(|iv| {
                if clip {
                    iv.with_bounds(iv.start().max(start), iv.end().min(end))
                } else {
                    iv.clone()
                }
            })
            .collect()
    }

    /// Returns the subset overlapping `[start, end]`, clipped.
    #[must_use]
    pub fn clipped(&self, start: i64, end: i64) -> Self {
        Self {
            list: self.spanned(start, end, true),
        }
    }

    /// Returns true if `point` is covered.
    #[must_use]
    pub fn contains(&self, point: i64) -> bool {
        let idx = self.list.partition_point(|x| x.end() < point);
        self.list.get(idx).is_some_and(|iv| iv.start() <= point)
    }

    /// Returns true if every position of `[start, end]` is covered.
    #[must_use]
    pub fn covers(&self, start: i64, end: i64) -> bool {
        let mut next = start;
        for iv in self.spanned(start, end, true) {
            if iv.start() > next {
                return false;
            }
            next = iv.end() + 1;
        }
        next > end
    }

    /// Checks ordering, non-overlap and bound sanity.
    #[must_use]
    pub fn is_well_formed(&self) -> bool {
        self.list.iter().all(|iv| iv.start() <= iv.end())
            && self.list.windows(2).all(|w| w[0].end() < w[1].start())
    }
}

impl IntervalSet<TaggedInterval> {
    /// Drops the tags, coalescing touching ranges.
    #[must_use]
    pub fn untagged(&self) -> IntervalSet<SimpleInterval> {
        IntervalSet::from_intervals(
            self.list
                .iter()
                .map(|iv| SimpleInterval::new(iv.start, iv.end)),
        )
    }
}

impl<'a, I> IntoIterator for &'a IntervalSet<I> {
    type Item = &'a I;
    type IntoIter = std::slice::Iter<'a, I>;

    fn into_iter(self) -> Self::IntoIter {
        self.list.iter()
    }
}
