//! Locality ordering of read batches.
//!
//! The scheduler only reorders and partitions work; results carry the
//! position of their request so callers can restore the client's order.

use crate::error::FsResult;
use crate::fsid::FsId;
use crate::store::Location;
use crate::types::FileKind;

/// Maps identifiers to a physical locality hint.
pub trait LocationFactory {
    /// Location of `id`, or `None` if it has no storage yet.
    fn location(&self, kind: FileKind, id: &FsId) -> FsResult<Option<Location>>;
}

/// One request of a batch, tagged with its position in the batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scheduled<T> {
    /// Position in the original request.
    pub order: usize,
    /// Locality hint used for sorting.
    pub location: Option<Location>,
    /// The request itself.
    pub item: T,
}

/// Orders and partitions batches by storage locality.
#[derive(Debug, Clone, Copy)]
pub struct Scheduler {
    chunks: usize,
}

impl Scheduler {
    /// Scheduler producing at most `chunks` chunks per batch.
    #[must_use]
    pub fn new(chunks: usize) -> Self {
        Self {
            chunks: chunks.max(1),
        }
    }

    /// Sorts `items` by location and splits them into contiguous chunks.
    ///
    /// Items without a location sort last. Items with equal locations keep
    /// their request order.
    pub fn schedule<T>(
        &self,
        factory: &dyn LocationFactory,
        kind: FileKind,
        items: Vec<T>,
        id_of: impl Fn(&T) -> &FsId,
    ) -> FsResult<Vec<Vec<Scheduled<T>>>> {
        let mut tagged = Vec::with_capacity(items.len());
        for (order, item) in items.into_iter().enumerate() {
            let location = factory.location(kind, id_of(&item))?;
            tagged.push(Scheduled {
                order,
                location,
                item,
            });
        }
        tagged.sort_by_key(|s| (s.location.is_none(), s.location, s.order));
        Ok(partition(tagged, self.chunks))
    }
}

/// Splits `items` into at most `chunks` runs of nearly equal length.
fn partition<T>(items: Vec<T>, chunks: usize) -> Vec<Vec<T>> {
    if items.is_empty() {
        return Vec::new();
    }
    let chunks = chunks.min(items.len());
    let base = items.len() / chunks;
    let extra = items.len() % chunks;
    let mut out = Vec::with_capacity(chunks);
    let mut iter = items.into_iter();
    for i in 0..chunks {
        let take = base + usize::from(i < extra);
        out.push(iter.by_ref().take(take).collect());
    }
    out
}

/// Puts results back into request order.
#[must_use]
pub fn reassemble<T>(chunks: Vec<Vec<(usize, T)>>) -> Vec<T> {
    let mut all: Vec<(usize, T)> = chunks.into_iter().flatten().collect();
    all.sort_by_key(|(order, _)| *order);
    all.into_iter().map(|(_, item)| item).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct Fixed(HashMap<String, Location>);

    impl LocationFactory for Fixed {
        fn location(&self, _kind: FileKind, id: &FsId) -> FsResult<Option<Location>> {
            Ok(self.0.get(id.as_str()).copied())
        }
    }

    fn loc(root: usize, file_id: u64) -> Location {
        Location { root, file_id }
    }

    #[test]
    fn sorts_by_location_and_keeps_order_tags() {
        let factory = Fixed(HashMap::from([
            ("/a".to_string(), loc(0, 9)),
            ("/b".to_string(), loc(0, 1)),
            ("/c".to_string(), loc(1, 0)),
        ]));
        let ids: Vec<FsId> = ["/a", "/missing", "/b", "/c"]
            .iter()
            .map(|s| FsId::new(s).unwrap())
            .collect();
        let chunks = Scheduler::new(1)
            .schedule(&factory, FileKind::TimeSeries, ids, |id| id)
            .unwrap();
        assert_eq!(chunks.len(), 1);
        let order: Vec<usize> = chunks[0].iter().map(|s| s.order).collect();
        assert_eq!(order, vec![2, 0, 3, 1]);
        assert!(chunks[0][3].location.is_none());
    }

    #[test]
    fn partitions_evenly_and_reassembles() {
        let factory = Fixed(HashMap::new());
        let ids: Vec<FsId> = (0..7)
            .map(|i| FsId::new(&format!("/n/{i}")).unwrap())
            .collect();
        let chunks = Scheduler::new(3)
            .schedule(&factory, FileKind::Blob, ids.clone(), |id| id)
            .unwrap();
        assert_eq!(
            chunks.iter().map(Vec::len).collect::<Vec<_>>(),
            vec![3, 2, 2]
        );
        let results: Vec<Vec<(usize, FsId)>> = chunks
            .into_iter()
            .rev()
            .map(|c| c.into_iter().map(|s| (s.order, s.item)).collect())
            .collect();
        assert_eq!(reassemble(results), ids);
    }

    #[test]
    fn empty_batch() {
        let factory = Fixed(HashMap::new());
        let chunks = Scheduler::new(4)
            .schedule(&factory, FileKind::Mjd, Vec::<FsId>::new(), |id| id)
            .unwrap();
        assert!(chunks.is_empty());
    }
}
