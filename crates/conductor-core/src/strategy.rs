//! Partition Strategies
//!
//! A strategy maps `(total_size, instance_count)` to an ordered shard table.
//! Every instance computes the table on its own, so a strategy must be a pure
//! function: the same inputs always produce the same ranges in the same order.
//!
//! Contract for implementors:
//! - `instance_count == 0` yields an empty table
//! - ranges are ordered by `shard_id`, with ids `0..instance_count`
//! - ranges are disjoint, contiguous, and cover `[0, total_size)` exactly

use crate::range::Range;
use std::fmt;

/// Computes the shard table for a given fleet size.
pub trait PartitionStrategy: Send + Sync + fmt::Debug {
    /// Split `[0, total_size)` into one range per instance slot.
    fn calculate(&self, total_size: u64, instance_count: usize) -> Vec<Range>;

    /// Short identifier used in logs.
    fn name(&self) -> &'static str;
}

/// Even split: the first `total_size % instance_count` shards get one extra key.
///
/// Shard 0 is always the first range and, when sizes differ, one of the larger ones.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvenSplit;

impl PartitionStrategy for EvenSplit {
    fn calculate(&self, total_size: u64, instance_count: usize) -> Vec<Range> {
        if instance_count == 0 {
            return Vec::new();
        }

        let count = instance_count as u64;
        let base = total_size / count;
        let remainder = total_size % count;

        let mut ranges = Vec::with_capacity(instance_count);
        let mut start = 0u64;
        for shard_id in 0..count {
            let size = if shard_id < remainder { base + 1 } else { base };
            ranges.push(Range::new(shard_id as u32, start, start + size));
            start += size;
        }

        ranges
    }

    fn name(&self) -> &'static str {
        "even-split"
    }
}
