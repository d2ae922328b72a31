//! Time-bucketed secondary index over subscription deadlines.

use crate::types::{SubscriptionId, TimeStamp};
use std::collections::BTreeMap;

/// Subscription ids grouped by the epoch second their deadline falls in.
///
/// Not synchronized; the registry keeps it under its own lock.
#[derive(Clone, Debug, Default)]
pub struct ExpiryIndex {
    buckets: BTreeMap<i64, Vec<SubscriptionId>>,
}

impl ExpiryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `id` to the bucket of `deadline`'s second.
    pub fn index(&mut self, id: SubscriptionId, deadline: TimeStamp) {
        let bucket = self.buckets.entry(deadline.seconds).or_default();
        if !bucket.contains(&id) {
            bucket.push(id);
        }
    }

    /// Remove `id` from its bucket. The bucket itself stays, possibly empty.
    ///
    /// Returns false if the id was not in that bucket.
    pub fn unindex(&mut self, id: SubscriptionId, deadline: TimeStamp) -> bool {
        match self.buckets.get_mut(&deadline.seconds) {
            Some(bucket) => match bucket.iter().position(|i| *i == id) {
                Some(pos) => {
                    bucket.swap_remove(pos);
                    true
                }
                None => false,
            },
            None => false,
        }
    }

    /// Ids in every bucket at or before `now`, oldest bucket first.
    pub fn due(&self, now: TimeStamp) -> Vec<SubscriptionId> {
        self.buckets
            .range(..=now.seconds)
            .flat_map(|(_, ids)| ids.iter().copied())
            .collect()
    }

    /// Claim every id due at `now`, leaving the emptied buckets in place.
    ///
    /// Each id is handed out once; a second call for the same `now` yields
    /// nothing unless something was indexed there meanwhile.
    pub fn take_due(&mut self, now: TimeStamp) -> Vec<SubscriptionId> {
        self.buckets
            .range_mut(..=now.seconds)
            .flat_map(|(_, ids)| std::mem::take(ids))
            .collect()
    }

    /// Drop empty buckets at or before `now`. Returns how many went.
    pub fn prune(&mut self, now: TimeStamp) -> usize {
        let empty: Vec<i64> = self
            .buckets
            .range(..=now.seconds)
            .filter(|(_, ids)| ids.is_empty())
            .map(|(epoch, _)| *epoch)
            .collect();
        for epoch in &empty {
            self.buckets.remove(epoch);
        }
        empty.len()
    }

    pub fn bucket(&self, epoch: i64) -> Option<&[SubscriptionId]> {
        self.buckets.get(&epoch).map(Vec::as_slice)
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Number of indexed ids across all buckets.
    pub fn len(&self) -> usize {
        self.buckets.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
