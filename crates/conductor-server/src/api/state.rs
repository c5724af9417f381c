//! Application State
//!
//! Shared state passed to all API handlers.

use crate::observability::MetricsState;
use crate::sharding::Coordinator;
use crate::store::KvStore;
use std::sync::Arc;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<Coordinator>,
    pub store: Arc<dyn KvStore>,
    pub metrics_state: Option<MetricsState>,
}
