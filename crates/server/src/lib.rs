//! vectorAIz operational control plane.
//!
//! HTTP surface, middlewares, probes, collectors, and background tasks.
//! Product surfaces (upload, search, chat) consume this crate through the
//! metering guard, the structured error type, and the correlation
//! middleware; everything else here is self-contained.

pub mod api;
pub mod auth;
pub mod background;
pub mod collectors;
pub mod db;
pub mod error_response;
pub mod keystore;
pub mod lock;
pub mod metering_guard;
pub mod middleware;
pub mod probes;
pub mod resource_guards;
pub mod router;
pub mod state;

#[cfg(test)]
pub mod test_support;

pub use error_response::ApiError;
pub use metering_guard::{metered_data, metered_setup};
pub use state::{ingestion_blocked, AppState};
