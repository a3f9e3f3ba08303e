use axum::{extract::State, http::StatusCode, Json};
use event_bus::RuntimeState;
use serde_json::{json, Value};
use std::sync::Arc;

use super::AppState;

/// Health check endpoint handler
pub async fn health() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "starter-sync",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Ready once the consumer runtime has joined its group
pub async fn ready(State(state): State<Arc<AppState>>) -> Result<Json<Value>, StatusCode> {
    let consumer = *state.consumer_state.borrow();
    if consumer != RuntimeState::Running {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }

    Ok(Json(json!({
        "status": "ready",
        "consumer": "running"
    })))
}
