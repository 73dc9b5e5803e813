//! HTTP router construction.
//!
//! Assembles routes, middlewares, the panic handler, and the OpenAPI docs
//! into a single `Router`.

use std::sync::Arc;

use axum::http::StatusCode;
use axum::middleware::from_fn_with_state;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::CorsLayer;
use utoipa::OpenApi;
use utoipa_scalar::{Scalar, Servable};

use crate::api;
use crate::auth::require_api_key;
use crate::middleware::correlation_middleware;
use crate::state::AppState;

/// Build the complete application router with all routes and middleware.
pub fn build_router(state: Arc<AppState>) -> Router {
    // Endpoints exposing infrastructure detail sit behind the API key.
    let protected = Router::new()
        .route("/health/deep", get(api::health_deep))
        .route("/health/issues", get(api::health_issues))
        .route("/diagnostics/bundle", post(api::diagnostics_bundle))
        .route("/system/serial", post(api::provision_serial))
        .route_layer(from_fn_with_state(state.clone(), require_api_key));

    let app = Router::new()
        .route("/health", get(api::health))
        .route("/system/info", get(api::system_info))
        .route("/system/mode", get(api::system_mode))
        .route("/system/billing-status", get(api::billing_status))
        .route("/version", get(api::version))
        .merge(protected)
        .fallback(not_found)
        .layer(CatchPanicLayer::custom(handle_panic))
        .layer(from_fn_with_state(state.clone(), correlation_middleware))
        .layer(CorsLayer::permissive())
        .with_state(state);

    app.merge(Scalar::with_url("/docs", api::doc::ApiDoc::openapi()))
}

async fn not_found() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({ "detail": "Not Found" })),
    )
}

/// Last-resort handler: a panicking route logs with whatever payload it
/// carried and answers a generic 500.
fn handle_panic(payload: Box<dyn std::any::Any + Send + 'static>) -> axum::response::Response {
    let detail = payload
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| payload.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic");
    tracing::error!(panic = detail, "handler panicked");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "detail": "Internal Server Error" })),
    )
        .into_response()
}
