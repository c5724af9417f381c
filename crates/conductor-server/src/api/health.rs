//! Health Check Endpoints
//!
//! Liveness and readiness probe handlers for Kubernetes.

use super::state::AppState;
use axum::{extract::State, http::StatusCode};
use std::time::Duration;

/// Liveness probe endpoint. Verifies the store connection is healthy and
/// that the membership lease is still being renewed.
#[tracing::instrument(skip(state))]
pub async fn health_check(State(state): State<AppState>) -> Result<&'static str, StatusCode> {
    if state.coordinator.registry().is_degraded() {
        tracing::warn!("Membership lease lost, keepalive stopped");
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }

    match tokio::time::timeout(Duration::from_secs(2), state.store.health()).await {
        Ok(Ok(())) => Ok("OK"),
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "Store health check failed");
            Err(StatusCode::SERVICE_UNAVAILABLE)
        }
        Err(_) => {
            tracing::warn!("Store health check timed out");
            Err(StatusCode::REQUEST_TIMEOUT)
        }
    }
}

/// Readiness probe endpoint. Ready once this instance holds a shard.
#[tracing::instrument(skip(state))]
pub async fn readiness_check(State(state): State<AppState>) -> Result<&'static str, StatusCode> {
    if state.coordinator.has_shard() {
        Ok("READY")
    } else {
        Err(StatusCode::SERVICE_UNAVAILABLE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ShardingConfig;
    use crate::sharding::Coordinator;
    use crate::shutdown;
    use crate::store::{KvStore, MemoryStore};
    use std::sync::Arc;

    fn state(store: &MemoryStore) -> AppState {
        let store: Arc<dyn KvStore> = Arc::new(store.clone());
        AppState {
            coordinator: Coordinator::new(store.clone(), ShardingConfig::default()),
            store,
            metrics_state: None,
        }
    }

    #[tokio::test]
    async fn test_health_reflects_store() {
        let store = MemoryStore::new();
        let state = state(&store);

        assert_eq!(health_check(State(state.clone())).await, Ok("OK"));

        store.set_unavailable(true);
        assert_eq!(
            health_check(State(state)).await,
            Err(StatusCode::SERVICE_UNAVAILABLE)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_fails_after_lease_loss() {
        let store = MemoryStore::new();
        let state = state(&store);
        let (_trigger, signal) = shutdown::channel();
        let registration = state.coordinator.registry().register(signal).await.unwrap();
        assert_eq!(health_check(State(state.clone())).await, Ok("OK"));

        store.lease_revoke(registration.lease_id).await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(
            health_check(State(state)).await,
            Err(StatusCode::SERVICE_UNAVAILABLE)
        );
    }

    #[tokio::test]
    async fn test_ready_once_shard_held() {
        let store = MemoryStore::new();
        let state = state(&store);

        assert_eq!(
            readiness_check(State(state.clone())).await,
            Err(StatusCode::SERVICE_UNAVAILABLE)
        );

        let (_trigger, signal) = shutdown::channel();
        state.coordinator.registry().register(signal).await.unwrap();
        assert!(state.coordinator.try_claim_shard().await);

        assert_eq!(readiness_check(State(state)).await, Ok("READY"));
    }
}
