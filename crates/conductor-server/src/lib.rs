//! Conductor shard coordination
//!
//! Splits a fixed key-space across the live instances of the conductor
//! service using etcd leases for membership and atomic creates for shard
//! ownership. Each instance runs one [`sharding::Coordinator`] which
//! converges, without any central assigner, on holding exactly one shard.

pub mod api;
pub mod config;
pub mod observability;
pub mod sharding;
pub mod shutdown;
pub mod store;
pub mod version;
