//! Error → HTTP response mapping.
//!
//! Three distinct paths: structured domain errors are sanitized through the
//! registry, metering errors map to their own statuses and shapes, and
//! everything else becomes a generic 500. Internal detail and context reach
//! the logs, never the body.

use std::sync::OnceLock;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use vaiz_core::registry::Severity;
use vaiz_core::{error_registry, VaizError};
use vaiz_serial::MeteringError;

/// Base URL used to derive serial registration links in 402 bodies.
static REGISTER_URL_BASE: OnceLock<String> = OnceLock::new();

pub fn init_register_url_base(base: &str) {
    let _ = REGISTER_URL_BASE.set(base.trim_end_matches('/').to_string());
}

fn register_url(serial: &str) -> String {
    let base = REGISTER_URL_BASE
        .get()
        .map(String::as_str)
        .unwrap_or("https://ai.market");
    format!("{base}/register?serial={serial}")
}

pub enum ApiError {
    Structured(VaizError),
    Metering(MeteringError),
    Internal(anyhow::Error),
}

impl From<VaizError> for ApiError {
    fn from(err: VaizError) -> Self {
        Self::Structured(err)
    }
}

impl From<MeteringError> for ApiError {
    fn from(err: MeteringError) -> Self {
        Self::Metering(err)
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            Self::Structured(err) => structured_response(err),
            Self::Metering(err) => metering_response(err),
            Self::Internal(err) => {
                tracing::error!(error = format!("{err:#}"), "unhandled internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "detail": "Internal Server Error" })),
                )
                    .into_response()
            }
        }
    }
}

fn structured_response(err: VaizError) -> Response {
    let entry = error_registry().and_then(|reg| reg.get(&err.code)).cloned();

    let Some(entry) = entry else {
        // Code missing from the registry: never leak anything, fall back to
        // a synthetic internal error.
        tracing::error!(
            error.code = %err.code,
            error.message = err.detail.as_deref().unwrap_or(""),
            "unregistered error code"
        );
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({
                "error": {
                    "code": err.code,
                    "title": "Internal error",
                    "message": "An unexpected error occurred.",
                    "retryable": false,
                    "user_action_required": false,
                    "remediation": [],
                }
            })),
        )
            .into_response();
    };

    log_structured(&err, &entry);

    let status =
        StatusCode::from_u16(entry.http_status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (
        status,
        Json(json!({
            "error": {
                "code": entry.code,
                "title": entry.title,
                "message": entry.safe_message,
                "retryable": entry.retryable,
                "user_action_required": entry.user_action_required,
                "remediation": entry.remediation,
            }
        })),
    )
        .into_response()
}

/// One log record at the severity the registry declares for the code.
fn log_structured(err: &VaizError, entry: &vaiz_core::ErrorEntry) {
    let ctx = serde_json::to_string(&err.context).unwrap_or_default();
    macro_rules! emit {
        ($level:ident) => {
            tracing::$level!(
                error.code = %err.code,
                error.kind = "VaizError",
                error.message = err.detail.as_deref().unwrap_or(""),
                error.message_safe = %entry.safe_message,
                error.retryable = entry.retryable,
                error.user_action_required = entry.user_action_required,
                error.ctx = %ctx,
                "{}",
                entry.title
            )
        };
    }
    match entry.severity {
        Severity::Debug => emit!(debug),
        Severity::Info => emit!(info),
        Severity::Warn => emit!(warn),
        Severity::Error | Severity::Critical => emit!(error),
    }
}

fn metering_response(err: MeteringError) -> Response {
    match err {
        MeteringError::Unprovisioned => {
            tracing::info!("metered request refused: unprovisioned");
            (
                StatusCode::FORBIDDEN,
                Json(json!({
                    "error": {
                        "code": "VAI-SER-004",
                        "reason": "unprovisioned",
                        "message": "Enter serial to continue",
                    }
                })),
            )
                .into_response()
        }
        MeteringError::ActivationRequired => {
            tracing::info!("metered request refused: activation required");
            (
                StatusCode::FORBIDDEN,
                Json(json!({
                    "error": {
                        "code": "VAI-SER-002",
                        "reason": "activation_required",
                        "message": "This installation is not activated",
                    }
                })),
            )
                .into_response()
        }
        MeteringError::CreditExhausted {
            category,
            reason,
            remaining_usd,
            setup_remaining_usd,
            payment_enabled,
            serial,
        } => {
            tracing::info!(
                category = %category,
                reason = %reason,
                "metered request refused: credits exhausted"
            );
            (
                StatusCode::PAYMENT_REQUIRED,
                Json(json!({
                    "error": {
                        "code": "VAI-SER-003",
                        "reason": reason,
                        "category": category.as_str(),
                        "remaining_usd": remaining_usd,
                        "setup_remaining_usd": setup_remaining_usd,
                        "payment_enabled": payment_enabled,
                        "register_url": register_url(&serial),
                    }
                })),
            )
                .into_response()
        }
    }
}
