//! Diagnostic bundle endpoint.
//!
//! Bundle generation is expensive, so it is rate limited to one per minute
//! globally and capped at 30 seconds of wall clock.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde_json::json;

use vaiz_core::VaizError;
use vaiz_diagnostics::{BundleError, DiagnosticService};

use crate::collectors::default_collectors;
use crate::error_response::ApiError;
use crate::state::AppState;

pub const BUNDLE_RATE_LIMIT: Duration = Duration::from_secs(60);

/// Generate and download a diagnostic zip bundle. Auth required.
#[utoipa::path(
    post,
    path = "/diagnostics/bundle",
    tag = "diagnostics",
    responses(
        (status = 200, description = "Zip archive", content_type = "application/zip"),
        (status = 429, description = "A bundle was generated within the last minute"),
        (status = 504, description = "Generation exceeded the 30s limit"),
    )
)]
pub async fn diagnostics_bundle(
    State(state): State<Arc<AppState>>,
) -> Result<Response, ApiError> {
    if let Some(retry_after) = state.bundle_retry_after(BUNDLE_RATE_LIMIT) {
        let err = VaizError::new("VAI-DIA-002")
            .expect("registry code")
            .with_detail("bundle requested inside the rate window")
            .with_context("retry_after_s", retry_after);
        let mut response = ApiError::from(err).into_response();
        if let Ok(value) = HeaderValue::from_str(&retry_after.to_string()) {
            response.headers_mut().insert(header::RETRY_AFTER, value);
        }
        return Ok(response);
    }
    state.mark_bundle_generated();

    tracing::info!("diagnostic bundle requested");
    let service = DiagnosticService::new(default_collectors(&state));

    let bytes = match service.generate_bundle().await {
        Ok(bytes) => bytes,
        Err(BundleError::Timeout) => {
            tracing::error!("diagnostic bundle generation timed out");
            return Ok((
                StatusCode::GATEWAY_TIMEOUT,
                Json(json!({ "detail": "Bundle generation timed out (30s limit)." })),
            )
                .into_response());
        }
        Err(e) => {
            return Err(VaizError::new("VAI-DIA-001")
                .expect("registry code")
                .with_detail(e.to_string())
                .into());
        }
    };

    let filename = format!(
        "vectoraiz-diagnostic-{}.zip",
        Utc::now().format("%Y%m%dT%H%M%SZ")
    );
    let mut response = bytes.into_response();
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/zip"),
    );
    if let Ok(value) =
        HeaderValue::from_str(&format!("attachment; filename=\"{filename}\""))
    {
        response
            .headers_mut()
            .insert(header::CONTENT_DISPOSITION, value);
    }
    Ok(response)
}
