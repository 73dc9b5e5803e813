//! Request-scoped metering guard.
//!
//! Chargeable routes are wrapped with `metered_setup` / `metered_data`;
//! the guard picks the strategy for the current serial phase, builds the
//! idempotent request id from the route, and refuses the request by
//! raising a metering error. Standalone mode meters nothing.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;

use vaiz_serial::{
    make_request_id, LedgerMeteringStrategy, MeterCategory, MeterDecision, MeteringStrategy,
    SerialMeteringStrategy, SerialPhase,
};

use crate::error_response::ApiError;
use crate::state::AppState;

pub async fn metered_setup(
    state: State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    metered(MeterCategory::Setup, state, request, next).await
}

pub async fn metered_data(
    state: State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    metered(MeterCategory::Data, state, request, next).await
}

async fn metered(
    category: MeterCategory,
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if state.config.is_standalone() {
        request.extensions_mut().insert(MeterDecision {
            allowed: true,
            category,
            offline: false,
            reason: None,
        });
        return Ok(next.run(request).await);
    }

    let snapshot = state.serial_store.snapshot();
    let strategy: Box<dyn MeteringStrategy> = if snapshot.state == SerialPhase::Migrated {
        Box::new(LedgerMeteringStrategy)
    } else {
        Box::new(SerialMeteringStrategy::new(
            state.serial_store.clone(),
            state.serial_client.clone(),
            state.offline_queue.clone(),
            state.config.metering.offline_data_failure_limit,
        ))
    };

    let endpoint = format!("{}:{}", request.method(), request.uri().path());
    let request_id = make_request_id(&snapshot.serial, &endpoint);
    let cost = category.default_cost_usd();

    let decision = strategy.check_and_meter(category, cost, &request_id).await?;
    request.extensions_mut().insert(decision);
    Ok(next.run(request).await)
}
