//! Observability Module
//!
//! - `tracing`: subscriber set-up with optional OpenTelemetry export
//! - `metrics`: Prometheus metrics for membership and shard ownership
//! - `events`: structured events with consistent field names
//! - `supervision`: panic-safe spawning of background tasks

pub mod events;
pub mod metrics;
pub mod supervision;
pub mod tracing;

pub use self::metrics::{init_metrics, MetricsState};
pub use supervision::spawn_supervised;
pub use self::tracing::{init_tracing, shutdown_tracing, TracingConfig};
