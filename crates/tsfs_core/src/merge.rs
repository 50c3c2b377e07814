//! Chunking of interval lists into positioned I/O operations.
//!
//! A chunk is one contiguous positioned read or write. Consecutive
//! intervals share a chunk when the gap between them is small enough, in
//! which case the gap bytes travel with the chunk. In merge mode a gap may
//! only be bridged if no existing data lives in it, since the gap bytes
//! would physically overwrite that data.

use crate::interval::SimpleInterval;

/// One positioned I/O unit covering `[start, end]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IoChunk {
    /// First position touched.
    pub start: i64,
    /// Last position touched.
    pub end: i64,
    /// Intervals carried by this chunk, in order.
    pub intervals: Vec<SimpleInterval>,
}

impl IoChunk {
    fn open(iv: SimpleInterval) -> Self {
        Self {
            start: iv.start,
            end: iv.end,
            intervals: vec![iv],
        }
    }

    fn extend(&mut self, iv: SimpleInterval) {
        self.end = iv.end;
        self.intervals.push(iv);
    }

    /// Number of positions touched.
    #[must_use]
    pub fn len(&self) -> u64 {
        (self.end - self.start + 1) as u64
    }

    /// Chunks are never empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        false
    }
}

/// How the gap between two consecutive new intervals was judged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bridge {
    /// Nothing in the gap; the chunk may continue.
    Clear,
    /// An existing interval that starts before the gap reaches into it.
    ObstructedBefore,
    /// An existing interval starts inside the gap.
    ObstructedAfter,
    /// The gap exceeds the chunking threshold.
    TooWide,
}

impl Bridge {
    /// Returns true if the chunk may span the gap.
    #[must_use]
    pub fn can_bridge(self) -> bool {
        self == Self::Clear
    }
}

fn gap_len(prev: &SimpleInterval, next: &SimpleInterval) -> u64 {
    (next.start - prev.end - 1).max(0) as u64
}

/// Overwrite-mode chunker: splits only where a gap exceeds the threshold.
///
/// Also used for reads, where the gap bytes are simply discarded.
#[derive(Debug)]
pub struct TimeSeriesIntervalIterator<'a> {
    intervals: &'a [SimpleInterval],
    pos: usize,
    gap_threshold: u64,
}

impl<'a> TimeSeriesIntervalIterator<'a> {
    /// Chunks `intervals`, which must be sorted and non-overlapping.
    #[must_use]
    pub fn new(intervals: &'a [SimpleInterval], gap_threshold: u64) -> Self {
        Self {
            intervals,
            pos: 0,
            gap_threshold,
        }
    }
}

impl Iterator for TimeSeriesIntervalIterator<'_> {
    type Item = IoChunk;

    fn next(&mut self) -> Option<IoChunk> {
        let first = *self.intervals.get(self.pos)?;
        self.pos += 1;
        let mut chunk = IoChunk::open(first);
        while let Some(next) = self.intervals.get(self.pos) {
            let prev = chunk.intervals[chunk.intervals.len() - 1];
            if gap_len(&prev, next) > self.gap_threshold {
                break;
            }
            chunk.extend(*next);
            self.pos += 1;
        }
        Some(chunk)
    }
}

/// Merge-mode chunker.
///
/// Sweeps the existing valid list in lock-step with the new intervals and
/// refuses to bridge any gap that existing data occupies.
#[derive(Debug)]
pub struct TimeSeriesMergeIntervalIterator<'a> {
    intervals: &'a [SimpleInterval],
    existing: &'a [SimpleInterval],
    pos: usize,
    sweep: usize,
    gap_threshold: u64,
    decisions: Vec<Bridge>,
}

impl<'a> TimeSeriesMergeIntervalIterator<'a> {
    /// Chunks `intervals` against the `existing` valid list. Both lists must
    /// be sorted and non-overlapping.
    #[must_use]
    pub fn new(
        intervals: &'a [SimpleInterval],
        existing: &'a [SimpleInterval],
        gap_threshold: u64,
    ) -> Self {
        Self {
            intervals,
            existing,
            pos: 0,
            sweep: 0,
            gap_threshold,
            decisions: Vec::new(),
        }
    }

    /// Bridge decisions taken so far, one per consecutive pair.
    #[must_use]
    pub fn decisions(&self) -> &[Bridge] {
        &self.decisions
    }

    fn classify(&mut self, prev: &SimpleInterval, next: &SimpleInterval) -> Bridge {
        let gap_start = prev.end + 1;
        let gap_end = next.start - 1;
        if gap_start > gap_end {
            return Bridge::Clear;
        }
        if gap_len(prev, next) > self.gap_threshold {
            return Bridge::TooWide;
        }
        while self
            .existing
            .get(self.sweep)
            .is_some_and(|e| e.end < gap_start)
        {
            self.sweep += 1;
        }
        match self.existing.get(self.sweep) {
            Some(e) if e.start <= gap_start => Bridge::ObstructedBefore,
            Some(e) if e.start <= gap_end => Bridge::ObstructedAfter,
            _ => Bridge::Clear,
        }
    }
}

impl Iterator for TimeSeriesMergeIntervalIterator<'_> {
    type Item = IoChunk;

    fn next(&mut self) -> Option<IoChunk> {
        let first = *self.intervals.get(self.pos)?;
        self.pos += 1;
        let mut chunk = IoChunk::open(first);
        while let Some(next) = self.intervals.get(self.pos).copied() {
            let prev = chunk.intervals[chunk.intervals.len() - 1];
            let bridge = self.classify(&prev, &next);
            self.decisions.push(bridge);
            if !bridge.can_bridge() {
                break;
            }
            chunk.extend(next);
            self.pos += 1;
        }
        Some(chunk)
    }
}
