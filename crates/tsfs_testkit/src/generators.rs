//! Property-based test generators using proptest.
//!
//! Provides strategies for identifiers, intervals and series that satisfy
//! the engine's validity rules.

use proptest::prelude::*;
use tsfs_core::{FsId, MjdPoint, SimpleInterval, TaggedInterval, TimeSeriesCarrier};

/// Strategy for well-formed identifiers with one to four components.
pub fn fsid_strategy() -> impl Strategy<Value = FsId> {
    prop::collection::vec(
        prop::string::string_regex("[a-z][a-z0-9_]{0,7}").expect("Invalid regex"),
        1..=4,
    )
    .prop_map(|parts| FsId::new(&format!("/{}", parts.join("/"))).expect("valid identifier"))
}

/// Strategy for an inclusive interval inside `[0, max]`.
pub fn interval_strategy(max: i64) -> impl Strategy<Value = SimpleInterval> {
    (0..=max, 0..=max).prop_map(|(a, b)| SimpleInterval::new(a.min(b), a.max(b)))
}

/// Strategy for a tagged interval inside `[0, max]` with a tag below `tags`.
pub fn tagged_interval_strategy(max: i64, tags: u64) -> impl Strategy<Value = TaggedInterval> {
    (interval_strategy(max), 0..tags.max(1))
        .prop_map(|(iv, tag)| TaggedInterval::new(iv.start, iv.end, tag))
}

/// Strategy for a fully valid int series at `id` inside `[0, max]`.
pub fn int_series_strategy(id: FsId, max: i64) -> impl Strategy<Value = TimeSeriesCarrier> {
    (interval_strategy(max), 1..16u64).prop_flat_map(move |(iv, origin)| {
        let id = id.clone();
        let len = (iv.end - iv.start + 1) as usize;
        prop::collection::vec(any::<i32>(), len).prop_map(move |values| {
            TimeSeriesCarrier::from_ints(id.clone(), iv.start, &values, origin)
                .expect("valid series")
        })
    })
}

/// Strategy for strictly ascending MJD points in `[start, start + span)`.
pub fn mjd_points_strategy(start: f64, span: f64) -> impl Strategy<Value = Vec<MjdPoint>> {
    prop::collection::btree_set(0u32..10_000, 0..32).prop_map(move |steps| {
        steps
            .into_iter()
            .map(|s| MjdPoint::new(start + span * f64::from(s) / 10_000.0, s as f32, 1))
            .collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tsfs_core::Interval;

    proptest! {
        #[test]
        fn generated_ids_parse(id in fsid_strategy()) {
            prop_assert!(FsId::new(id.as_str()).is_ok());
        }

        #[test]
        fn generated_series_are_valid(series in int_series_strategy(FsId::new("/p").unwrap(), 200)) {
            prop_assert!(series.validate().is_ok());
            prop_assert_eq!(series.valid.covered(), series.cadence_count());
        }

        #[test]
        fn generated_points_ascend(points in mjd_points_strategy(50000.0, 10.0)) {
            prop_assert!(points.windows(2).all(|w| w[0].mjd < w[1].mjd));
        }

        #[test]
        fn tagged_intervals_stay_in_range(iv in tagged_interval_strategy(100, 4)) {
            prop_assert!(iv.start() >= 0 && iv.end() <= 100 && iv.tag < 4);
        }
    }
}
