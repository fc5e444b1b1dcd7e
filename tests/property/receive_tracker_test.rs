// tests/property/receive_tracker_test.rs

//! Property-based tests for `ReceiveTracker` against a plain set.

use craftlink::core::rpc::ReceiveTracker;
use proptest::prelude::*;
use std::collections::BTreeSet;

/// Merged ranges in a sorted set of ids.
fn ranges_in(ids: &BTreeSet<u32>) -> usize {
    let mut count = 0;
    let mut previous: Option<u32> = None;
    for &id in ids {
        if previous.is_none_or(|p| p.checked_add(1) != Some(id)) {
            count += 1;
        }
        previous = Some(id);
    }
    count
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 300,
        ..ProptestConfig::default()
    })]

    #[test]
    fn test_observe_matches_set_semantics(ids in prop::collection::vec(0u32..200, 0..400)) {
        let mut tracker = ReceiveTracker::new();
        let mut seen = BTreeSet::new();
        for id in ids {
            prop_assert_eq!(tracker.observe(id), seen.insert(id));
        }
        for id in 0..200 {
            prop_assert_eq!(tracker.contains(id), seen.contains(&id));
        }
        prop_assert_eq!(tracker.range_count(), ranges_in(&seen));
    }

    #[test]
    fn test_in_order_delivery_keeps_one_range(start in 0u32..u32::MAX - 1000, len in 1u32..500) {
        let mut tracker = ReceiveTracker::new();
        let end = start + len;
        for id in start..end {
            prop_assert!(tracker.observe(id));
        }
        prop_assert_eq!(tracker.range_count(), 1);
        for id in start..end {
            prop_assert!(!tracker.observe(id));
        }
    }

    #[test]
    fn test_wide_ids(ids in prop::collection::vec(any::<u32>(), 0..100)) {
        let mut tracker = ReceiveTracker::new();
        let mut seen = BTreeSet::new();
        for id in ids {
            prop_assert_eq!(tracker.observe(id), seen.insert(id));
        }
        prop_assert_eq!(tracker.range_count(), ranges_in(&seen));
    }
}
