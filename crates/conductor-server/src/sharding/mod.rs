//! Shard Coordination
//!
//! Splits the fixed key-space across live conductor instances so that each
//! instance owns exactly one contiguous range at a time.
//!
//! - [`MembershipRegistry`]: lease-bound "I am alive" records
//! - [`ShardClaimer`]: atomic claim and release of shard records
//! - [`Coordinator`]: the per-instance control loop tying both together
//!
//! Store layout:
//! - `{instance_prefix}/{lease_id}` -> instance identity (`host:port`)
//! - `{shard_prefix}/{shard_id}` -> JSON `{holder, shard_id, start, end}`

mod claimer;
mod coordinator;
mod error;
mod registry;

pub use claimer::{ClaimOutcome, ShardClaimer};
pub use coordinator::{Coordinator, CoordinatorPhase};
pub use error::ShardError;
pub use registry::{MembershipRegistry, Registration};
