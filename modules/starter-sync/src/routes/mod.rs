pub mod health;
pub mod metrics;
pub mod sync;

use axum::{
    routing::{get, post},
    Router,
};
use event_bus::{Producer, RuntimeState};
use std::sync::Arc;
use tokio::sync::watch;

use crate::metrics::SyncMetrics;

/// Shared state for every HTTP handler
#[derive(Clone)]
pub struct AppState {
    pub metrics: SyncMetrics,
    pub producer: Producer,
    pub starter_topic: String,
    pub notification_topic: String,
    pub consumer_state: watch::Receiver<RuntimeState>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(health::health))
        .route("/api/ready", get(health::ready))
        .route("/metrics", get(metrics::metrics))
        .route(
            "/api/sync/starters/{domain}/index",
            post(sync::request_starter_index),
        )
        .route(
            "/api/sync/departments/{department}/leader",
            post(sync::assign_leader),
        )
        .with_state(state)
}
