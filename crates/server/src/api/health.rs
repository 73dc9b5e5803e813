//! Health endpoints: the cheap liveness check, the authenticated deep
//! component check, and the active-issue list.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use utoipa::ToSchema;

use vaiz_core::issue_tracker::issue_tracker;

use crate::probes::deep_health;
use crate::state::AppState;

#[derive(Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub service: &'static str,
    pub uptime_s: f64,
    pub timestamp: String,
}

/// Cheap health check. No I/O, no auth.
#[utoipa::path(
    get,
    path = "/health",
    tag = "health",
    responses((status = 200, description = "Service is alive", body = HealthResponse))
)]
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: vaiz_core::APP_VERSION,
        service: vaiz_core::SERVICE_NAME,
        uptime_s: (vaiz_core::uptime_s() * 10.0).round() / 10.0,
        timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
    })
}

/// Deep health check with bounded per-component probes. Auth required —
/// the response exposes infrastructure details.
#[utoipa::path(
    get,
    path = "/health/deep",
    tag = "health",
    responses((status = 200, description = "Per-component status, worst-of aggregated"))
)]
pub async fn health_deep(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(deep_health(&state).await)
}

/// Active non-critical issues from the issue tracker. Auth required.
#[utoipa::path(
    get,
    path = "/health/issues",
    tag = "health",
    responses((status = 200, description = "Issues seen within the last hour"))
)]
pub async fn health_issues() -> Json<Value> {
    let issues = issue_tracker().get_active_issues();
    Json(json!({
        "count": issues.len(),
        "issues": issues,
    }))
}
