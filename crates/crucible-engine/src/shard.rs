//! Weighted work distribution across a bounded number of shards.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

/// One balanced partition of a weighted work list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shard<T> {
    pub weight: u64,
    pub items: Vec<T>,
}

/// Distribute `items` into at most `max_shards` groups of roughly equal
/// total weight.
///
/// Greedy longest-processing-time: items are placed heaviest-first into the
/// currently lightest bucket. Each placement costs `1 + weight`, so large
/// shard counts are penalized and zero-weight items still fill buckets
/// evenly. Ties between equal-weight items break by original order.
pub fn shard<T, F>(items: Vec<T>, max_shards: usize, weight_fn: F) -> Vec<Shard<T>>
where
    F: Fn(&T) -> u64,
{
    if items.is_empty() || max_shards == 0 {
        return Vec::new();
    }
    let num_shards = items.len().min(max_shards);

    let mut weighted: Vec<(u64, T)> = items.into_iter().map(|t| (weight_fn(&t), t)).collect();
    // Stable sort keeps original order as the tie-break.
    weighted.sort_by_key(|(weight, _)| Reverse(*weight));

    let mut buckets: Vec<Shard<T>> = (0..num_shards)
        .map(|_| Shard {
            weight: 0,
            items: Vec::new(),
        })
        .collect();
    let mut heap: BinaryHeap<Reverse<(u64, usize)>> =
        (0..num_shards).map(|idx| Reverse((0, idx))).collect();

    for (weight, item) in weighted {
        if let Some(Reverse((total, idx))) = heap.pop() {
            let total = total + 1 + weight;
            buckets[idx].weight = total;
            buckets[idx].items.push(item);
            heap.push(Reverse((total, idx)));
        }
    }

    buckets
}
