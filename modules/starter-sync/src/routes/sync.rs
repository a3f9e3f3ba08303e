//! Sync trigger routes
//!
//! Both endpoints only enqueue an event and answer `202 Accepted`; the
//! outcome is visible through logs and `/metrics`, never to the caller.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

use super::AppState;
use crate::events::{index_event, leader_assignment_event, publish_detached};
use crate::models::LeaderAssignmentNotification;

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

fn bad_request(message: impl Into<String>) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
pub struct AssignLeaderRequest {
    pub leader_domain: String,
    #[serde(default)]
    pub assigned_by: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Handler for POST /api/sync/starters/{domain}/index
///
/// Asks the consumers to re-read one starter and index its current state.
pub async fn request_starter_index(
    State(state): State<Arc<AppState>>,
    Path(domain): Path<String>,
) -> Response {
    let domain = domain.trim();
    if domain.is_empty() {
        return bad_request("domain must not be empty");
    }

    let envelope = match index_event(domain) {
        Ok(envelope) => envelope,
        Err(e) => return bad_request(e.to_string()),
    };
    publish_detached(&state.producer, Some(state.starter_topic.clone()), envelope);

    (
        StatusCode::ACCEPTED,
        Json(json!({ "status": "accepted", "domain": domain })),
    )
        .into_response()
}

/// Handler for POST /api/sync/departments/{department}/leader
pub async fn assign_leader(
    State(state): State<Arc<AppState>>,
    Path(department): Path<String>,
    Json(request): Json<AssignLeaderRequest>,
) -> Response {
    let department = department.trim();
    let leader_domain = request.leader_domain.trim();
    if department.is_empty() || leader_domain.is_empty() {
        return bad_request("department and leader_domain are required");
    }

    let mut notification = LeaderAssignmentNotification::new(department, leader_domain);
    notification.assigned_by = request.assigned_by;
    notification.message = request.message;

    let envelope = match leader_assignment_event(&notification) {
        Ok(envelope) => envelope,
        Err(e) => return bad_request(e.to_string()),
    };
    publish_detached(
        &state.producer,
        Some(state.notification_topic.clone()),
        envelope,
    );

    (
        StatusCode::ACCEPTED,
        Json(json!({
            "status": "accepted",
            "department": department,
            "leader_domain": leader_domain
        })),
    )
        .into_response()
}
