//! Correlation middleware.
//!
//! Accepts inbound `X-Request-ID` / `X-Correlation-ID` headers or generates
//! fresh IDs, installs the scope around the handler so every log record is
//! tagged, echoes both headers back, and emits one completion record per
//! request.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue};
use axum::middleware::Next;
use axum::response::Response;

use vaiz_core::correlation::{self, CorrelationScope};

use crate::state::AppState;

pub const REQUEST_ID_HEADER: &str = "x-request-id";
pub const CORRELATION_ID_HEADER: &str = "x-correlation-id";

fn inbound_id(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(String::from)
}

pub async fn correlation_middleware(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let scope = CorrelationScope::for_request(
        inbound_id(request.headers(), REQUEST_ID_HEADER),
        inbound_id(request.headers(), CORRELATION_ID_HEADER),
    );
    let request_id = scope.request_id.clone();
    let correlation_id = scope.correlation_id.clone();

    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let start = Instant::now();

    state.metrics.requests_total.fetch_add(1, Ordering::Relaxed);

    let mut response = correlation::with_scope(scope, async {
        let response = next.run(request).await;
        let duration_ms = start.elapsed().as_secs_f64() * 1000.0;
        tracing::info!(
            http.method = %method,
            http.path = %path,
            http.status_code = response.status().as_u16(),
            duration_ms = (duration_ms * 100.0).round() / 100.0,
            "request completed"
        );
        response
    })
    .await;

    if response.status().is_server_error() {
        state.metrics.responses_5xx.fetch_add(1, Ordering::Relaxed);
    }

    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(HeaderName::from_static(REQUEST_ID_HEADER), value);
    }
    if let Ok(value) = HeaderValue::from_str(&correlation_id) {
        headers.insert(HeaderName::from_static(CORRELATION_ID_HEADER), value);
    }
    response
}
