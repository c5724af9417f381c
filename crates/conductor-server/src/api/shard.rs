//! Shard Assignment Endpoint
//!
//! Exposes the local instance's shard at GET /shard

use super::AppState;
use crate::sharding::CoordinatorPhase;
use axum::{extract::State, Json};
use conductor_core::Range;
use serde::Serialize;

/// Response for GET /shard
#[derive(Debug, Serialize)]
pub struct ShardResponse {
    pub instance_key: Option<String>,
    pub lease_id: Option<i64>,
    pub phase: String,
    /// `null` while no shard is held
    pub range: Option<Range>,
}

#[tracing::instrument(skip(state))]
pub async fn get_shard(State(state): State<AppState>) -> Json<ShardResponse> {
    let coordinator = &state.coordinator;
    let registration = coordinator.registry().registration();

    Json(ShardResponse {
        instance_key: registration.as_ref().map(|r| r.instance_key.clone()),
        lease_id: registration.map(|r| r.lease_id),
        phase: phase_label(coordinator.phase()).to_string(),
        range: coordinator.shard_range(),
    })
}

fn phase_label(phase: CoordinatorPhase) -> &'static str {
    match phase {
        CoordinatorPhase::Unregistered => "unregistered",
        CoordinatorPhase::Registering => "registering",
        CoordinatorPhase::ClaimPending => "claim_pending",
        CoordinatorPhase::Holding => "holding",
        CoordinatorPhase::Releasing => "releasing",
    }
}
