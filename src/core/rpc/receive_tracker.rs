// src/core/rpc/receive_tracker.rs

//! Deduplicates inbound message ids so retransmission after a reconnect is safe.

use std::collections::BTreeMap;

/// The set of message ids already seen, stored as merged inclusive ranges.
///
/// Ids are mostly contiguous, so the map stays a handful of entries long even
/// after millions of messages.
#[derive(Debug, Default, Clone)]
pub struct ReceiveTracker {
    // start -> end, both inclusive; ranges never overlap or touch.
    ranges: BTreeMap<u32, u32>,
}

impl ReceiveTracker {
    pub fn new() -> Self {
        Default::default()
    }

    /// Records `id`. Returns true if it had not been seen before.
    pub fn observe(&mut self, id: u32) -> bool {
        if self.contains(id) {
            return false;
        }

        let joins_prev = self
            .ranges
            .range(..id)
            .next_back()
            .filter(|(_, end)| end.checked_add(1) == Some(id))
            .map(|(start, _)| *start);
        let joins_next = id
            .checked_add(1)
            .filter(|next| self.ranges.contains_key(next));

        match (joins_prev, joins_next) {
            (Some(start), Some(next)) => {
                let end = self.ranges.remove(&next).unwrap_or(next);
                self.ranges.insert(start, end);
            }
            (Some(start), None) => {
                self.ranges.insert(start, id);
            }
            (None, Some(next)) => {
                let end = self.ranges.remove(&next).unwrap_or(next);
                self.ranges.insert(id, end);
            }
            (None, None) => {
                self.ranges.insert(id, id);
            }
        }
        true
    }

    pub fn contains(&self, id: u32) -> bool {
        self.ranges
            .range(..=id)
            .next_back()
            .is_some_and(|(_, end)| *end >= id)
    }

    /// Number of disjoint ranges currently stored.
    pub fn range_count(&self) -> usize {
        self.ranges.len()
    }

    pub fn clear(&mut self) {
        self.ranges.clear();
    }
}
