//! Prometheus Metrics
//!
//! Metrics tracked:
//! - `conductor_shard_claims_total` - claim attempts by outcome
//! - `conductor_rebalances_total` - full re-claims by trigger reason
//! - `conductor_stale_shards_removed_total` - records deleted by cleanup
//! - `conductor_watch_resubscribes_total` - watch streams re-established
//! - `conductor_task_panics_total` - background task panics
//! - `conductor_instance_count` - live instances last observed
//! - `conductor_shard_held` - 1 while this instance holds a shard

use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// State containing the Prometheus handle for metrics export
#[derive(Clone)]
pub struct MetricsState {
    pub prometheus_handle: PrometheusHandle,
}

/// Install the Prometheus recorder and register metric descriptions.
pub fn init_metrics() -> Result<MetricsState, Box<dyn std::error::Error + Send + Sync>> {
    let handle = PrometheusBuilder::new().install_recorder()?;

    register_metric_descriptions();

    Ok(MetricsState {
        prometheus_handle: handle,
    })
}

fn register_metric_descriptions() {
    describe_counter!(
        "conductor_shard_claims_total",
        "Shard claim attempts by outcome"
    );
    describe_counter!(
        "conductor_rebalances_total",
        "Full shard re-claims by trigger reason"
    );
    describe_counter!(
        "conductor_stale_shards_removed_total",
        "Shard records removed by cleanup"
    );
    describe_counter!(
        "conductor_watch_resubscribes_total",
        "Watch streams re-established after closing"
    );
    describe_counter!(
        "conductor_task_panics_total",
        "Background task panics caught by the supervisor"
    );
    describe_gauge!(
        "conductor_instance_count",
        "Live instances in the membership namespace"
    );
    describe_gauge!(
        "conductor_shard_held",
        "Whether this instance currently holds a shard"
    );
}

/// Record a claim attempt ("acquired", "reclaimed", "taken", "error")
pub fn record_claim(outcome: &'static str) {
    counter!("conductor_shard_claims_total", "outcome" => outcome).increment(1);
}

pub fn record_rebalance(reason: &'static str) {
    counter!("conductor_rebalances_total", "reason" => reason).increment(1);
}

pub fn record_stale_removed(count: usize) {
    counter!("conductor_stale_shards_removed_total").increment(count as u64);
}

pub fn record_watch_resubscribe(stream: &'static str) {
    counter!("conductor_watch_resubscribes_total", "stream" => stream).increment(1);
}

pub fn record_task_panic(task: &'static str) {
    counter!("conductor_task_panics_total", "task" => task).increment(1);
}

pub fn set_instance_count(count: usize) {
    gauge!("conductor_instance_count").set(count as f64);
}

pub fn set_shard_held(held: bool) {
    gauge!("conductor_shard_held").set(if held { 1.0 } else { 0.0 });
}
