//! Internal API key authentication for the infrastructure-exposing
//! endpoints (deep health, issues, diagnostics, provisioning).
//!
//! Connected mode requires a configured key (enforced at startup). In
//! standalone mode with no key configured the check is a no-op, matching
//! the local-deployment posture.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;

use vaiz_core::VaizError;

use crate::error_response::ApiError;
use crate::state::AppState;

pub const API_KEY_HEADER: &str = "x-api-key";

pub async fn require_api_key(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let Some(expected) = state.config.security.internal_api_key.as_deref() else {
        return Ok(next.run(request).await);
    };

    let provided: Option<String> = request
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(String::from);

    match provided.as_deref() {
        Some(key) if constant_time_eq(key.as_bytes(), expected.as_bytes()) => {
            Ok(next.run(request).await)
        }
        _ => Err(VaizError::new("VAI-SEC-001")
            .expect("registry code")
            .with_detail("missing or mismatched X-API-Key header")
            .with_context("path", request.uri().path())
            .into()),
    }
}

/// Compare without early exit so timing does not reveal the match prefix.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
