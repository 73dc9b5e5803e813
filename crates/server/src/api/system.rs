//! System surface: mode and feature flags, billing status, version info,
//! and the external provisioning step.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use utoipa::ToSchema;

use vaiz_core::VaizError;
use vaiz_serial::SerialPhase;

use crate::background::check_for_updates;
use crate::error_response::ApiError;
use crate::state::AppState;

/// Public endpoint (no auth) returning system mode and feature flags.
#[utoipa::path(
    get,
    path = "/system/info",
    tag = "system",
    responses((status = 200, description = "Mode, version, and feature flags"))
)]
pub async fn system_info(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "mode": state.config.mode,
        "version": vaiz_core::APP_VERSION,
        "features": {
            "allai": state.config.features.allai_enabled,
            "marketplace": state.config.features.marketplace_enabled,
            "earnings": state.config.features.marketplace_enabled,
            "local_auth": true,
        },
    }))
}

/// Alias for `/system/info` with the shape the frontend nav expects.
#[utoipa::path(
    get,
    path = "/system/mode",
    tag = "system",
    responses((status = 200, description = "Mode and feature flags"))
)]
pub async fn system_mode(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "mode": state.config.mode,
        "features": {
            "marketplace": state.config.features.marketplace_enabled,
            "allai": state.config.features.allai_enabled,
            "earnings": state.config.features.marketplace_enabled,
        },
    }))
}

/// Serial billing state for the frontend. Public — only billing metadata,
/// never tokens.
#[utoipa::path(
    get,
    path = "/system/billing-status",
    tag = "system",
    responses((status = 200, description = "Billing mode, phase, and cached balances"))
)]
pub async fn billing_status(State(state): State<Arc<AppState>>) -> Json<Value> {
    let snapshot = state.serial_store.snapshot();
    let cached = &snapshot.last_status_cache;

    let mode = match snapshot.state {
        SerialPhase::Migrated => "ledger",
        SerialPhase::Active | SerialPhase::Degraded => "serial",
        SerialPhase::Provisioned => "provisioned",
        SerialPhase::Unprovisioned => "unprovisioned",
    };
    let phase = match snapshot.state {
        SerialPhase::Unprovisioned => "unprovisioned",
        SerialPhase::Provisioned => "provisioned",
        SerialPhase::Active => "active",
        SerialPhase::Degraded => "degraded",
        SerialPhase::Migrated => "migrated",
    };
    let serial_shown: Option<String> = if snapshot.serial.is_empty() {
        None
    } else {
        Some(format!(
            "{}...",
            snapshot.serial.chars().take(16).collect::<String>()
        ))
    };

    Json(json!({
        "mode": mode,
        "serial": serial_shown,
        "state": phase,
        "setup_remaining_usd": cached.get("setup_remaining_usd"),
        "data_remaining_usd": cached.get("data_remaining_usd"),
        "payment_enabled": cached.get("payment_enabled").and_then(Value::as_bool).unwrap_or(false),
        "last_status_at": snapshot.last_status_at,
    }))
}

#[derive(Deserialize)]
pub struct VersionQuery {
    #[serde(default)]
    pub force: bool,
}

/// Current and latest available version. Public.
#[utoipa::path(
    get,
    path = "/version",
    tag = "system",
    responses((status = 200, description = "Version and update availability"))
)]
pub async fn version(
    State(state): State<Arc<AppState>>,
    Query(query): Query<VersionQuery>,
) -> Result<Json<Value>, ApiError> {
    let info = check_for_updates(&state, query.force).await?;
    Ok(Json(info))
}

#[derive(Deserialize, ToSchema)]
pub struct ProvisionRequest {
    pub serial: String,
    pub bootstrap_token: String,
}

/// Store a serial and its one-shot bootstrap token, moving the machine to
/// PROVISIONED. The activation manager picks it up on its next tick. Auth
/// required.
#[utoipa::path(
    post,
    path = "/system/serial",
    tag = "system",
    responses(
        (status = 200, description = "Serial stored"),
        (status = 400, description = "Missing serial or bootstrap token"),
    )
)]
pub async fn provision_serial(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<ProvisionRequest>,
) -> Result<Json<Value>, ApiError> {
    let serial = payload.serial.trim();
    let bootstrap_token = payload.bootstrap_token.trim();
    if serial.is_empty() || bootstrap_token.is_empty() {
        return Err(VaizError::new("VAI-API-001")
            .expect("registry code")
            .with_detail("provisioning payload missing serial or bootstrap_token")
            .into());
    }

    state
        .serial_store
        .provision(serial, bootstrap_token)
        .map_err(|e| anyhow::Error::from(e).context("persisting provisioned serial"))?;

    let shown: String = serial.chars().take(16).collect();
    tracing::info!(serial = %shown, "serial provisioned");
    Ok(Json(json!({ "status": "provisioned" })))
}
