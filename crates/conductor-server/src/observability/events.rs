//! Structured Events
//!
//! One function per coordination event so field names stay consistent
//! across log lines. Every event carries an `event_type` field.

use conductor_core::Range;
use tracing::{error, info, warn};

pub fn instance_registered(instance_key: &str, lease_id: i64, identity: &str) {
    info!(
        event_type = "instance_registered",
        instance_key = %instance_key,
        lease_id = lease_id,
        identity = %identity,
        "Instance registered"
    );
}

pub fn instance_unregistered(instance_key: &str, lease_id: i64) {
    info!(
        event_type = "instance_unregistered",
        instance_key = %instance_key,
        lease_id = lease_id,
        "Instance unregistered"
    );
}

pub fn shard_claimed(range: &Range, instance_count: usize) {
    info!(
        event_type = "shard_claimed",
        shard_id = range.shard_id,
        start = range.start,
        end = range.end,
        instance_count = instance_count,
        "Shard claimed"
    );
}

pub fn shard_released(range: &Range) {
    info!(
        event_type = "shard_released",
        shard_id = range.shard_id,
        start = range.start,
        end = range.end,
        "Shard released"
    );
}

pub fn shard_lost(range: &Range, current_holder: Option<&str>) {
    warn!(
        event_type = "shard_lost",
        shard_id = range.shard_id,
        current_holder = ?current_holder,
        "Shard ownership lost"
    );
}

pub fn rebalance_triggered(reason: &'static str, instance_count: usize, shard_count: usize) {
    info!(
        event_type = "rebalance_triggered",
        reason = reason,
        instance_count = instance_count,
        shard_count = shard_count,
        "Rebalance triggered"
    );
}

pub fn stale_shard_removed(key: &str, holder: &str, reason: &'static str) {
    info!(
        event_type = "stale_shard_removed",
        key = %key,
        holder = %holder,
        reason = reason,
        "Stale shard record removed"
    );
}

pub fn task_panicked(task: &str, message: &str) {
    error!(
        event_type = "task_panicked",
        task = %task,
        panic = %message,
        "Background task panicked"
    );
}
