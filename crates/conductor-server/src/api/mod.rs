//! HTTP API Module
//!
//! Operational endpoints of the conductor binary. The coordination core does
//! not depend on any of this.
//!
//! This module contains:
//! - `state`: Shared application state
//! - `health`: Liveness and readiness probes
//! - `shard`: Local shard assignment
//! - `metrics`: Prometheus metrics endpoint
//! - `version`: Build information

mod health;
mod metrics;
mod shard;
mod state;
mod version;

pub use state::AppState;

use axum::{routing::get, Router};

/// Create the API router with all endpoints
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health checks
        .route("/health", get(health::health_check))
        .route("/ready", get(health::readiness_check))
        // Shard assignment
        .route("/shard", get(shard::get_shard))
        // Observability
        .route("/metrics", get(metrics::get_metrics))
        .route("/version", get(version::get_version))
        .with_state(state)
}
