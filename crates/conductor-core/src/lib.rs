//! Core shared types for conductor
//!
//! Shard ranges, the persisted shard record, and the partition strategies
//! every instance uses to compute the same shard table independently.

mod range;
mod strategy;

pub use range::{Range, ShardRecord};
pub use strategy::{EvenSplit, PartitionStrategy};

/// Size of the key-space partitioned across the fleet.
pub const TOTAL_KEY_SPACE: u64 = 1024;
