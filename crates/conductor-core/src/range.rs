//! Shard range and shard record types

use serde::{Deserialize, Serialize};
use std::fmt;

/// Half-open interval `[start, end)` of the key-space owned by one shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Range {
    pub shard_id: u32,
    pub start: u64,
    pub end: u64,
}

impl Range {
    pub fn new(shard_id: u32, start: u64, end: u64) -> Self {
        Self {
            shard_id,
            start,
            end,
        }
    }

    /// Whether `value` falls inside `[start, end)`.
    pub fn contains(&self, value: u64) -> bool {
        value >= self.start && value < self.end
    }

    /// Number of keys covered by the range.
    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Same `[start, end)` bounds, regardless of shard id.
    pub fn same_bounds(&self, other: &Range) -> bool {
        self.start == other.start && self.end == other.end
    }
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} [{}, {})", self.shard_id, self.start, self.end)
    }
}

/// Value persisted under `{shard_prefix}/{shard_id}`.
///
/// Encoded as flat JSON `{"holder", "shard_id", "start", "end"}`. `holder`
/// is the owning instance's membership key, which embeds its lease id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardRecord {
    pub holder: String,
    #[serde(flatten)]
    pub range: Range,
}

impl ShardRecord {
    pub fn new(holder: impl Into<String>, range: Range) -> Self {
        Self {
            holder: holder.into(),
            range,
        }
    }

    pub fn is_held_by(&self, instance_key: &str) -> bool {
        self.holder == instance_key
    }
}
