//! Keep-newest-N retention shared by message buckets and the store registry.

use std::collections::BTreeMap;

/// Anything that can be ordered by age for eviction purposes.
///
/// Entries without a natural timestamp return a monotonically increasing sequence
/// number instead; only relative order matters.
pub trait Timestamped {
    fn sort_key(&self) -> i128;
}

impl Timestamped for super::types::Message {
    /// Nanoseconds since the epoch, at the same precision `get_messages` sorts by.
    fn sort_key(&self) -> i128 {
        i128::from(self.timestamp.timestamp()) * 1_000_000_000
            + i128::from(self.timestamp.timestamp_subsec_nanos())
    }
}

/// Remove the oldest entries until `map` holds at most `max_size` entries.
///
/// Entries are ordered by [`Timestamped::sort_key`] with a stable sort over the map's
/// key order, so equal timestamps are evicted lowest-key first. Returns the evicted
/// entries, oldest first.
pub fn evict_oldest_entries<K, V>(map: &mut BTreeMap<K, V>, max_size: usize) -> Vec<(K, V)>
where
    K: Ord + Clone,
    V: Timestamped,
{
    if map.len() <= max_size {
        return Vec::new();
    }

    let mut order: Vec<(i128, K)> = map.iter().map(|(k, v)| (v.sort_key(), k.clone())).collect();
    order.sort_by_key(|(ts, _)| *ts);

    let to_remove = map.len() - max_size;
    order
        .into_iter()
        .take(to_remove)
        .filter_map(|(_, k)| map.remove_entry(&k))
        .collect()
}
