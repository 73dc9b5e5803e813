pub mod config;
pub mod correlation;
pub mod error;
pub mod issue_tracker;
pub mod log_buffer;
pub mod logging;
pub mod redaction;
pub mod registry;

pub use config::Config;
pub use error::*;
pub use registry::{error_registry, init_error_registry, ErrorEntry, ErrorRegistry};

use std::sync::OnceLock;
use std::time::Instant;

/// Service identity stamped into every log record and health response.
pub const SERVICE_NAME: &str = "vectoraiz-backend";
pub const APP_VERSION: &str = "1.8.0";

static STARTED_AT: OnceLock<Instant> = OnceLock::new();

/// Record process start time. Idempotent; called once from startup wiring.
pub fn mark_started() {
    STARTED_AT.get_or_init(Instant::now);
}

/// Wall-clock seconds since `mark_started()`.
pub fn uptime_s() -> f64 {
    STARTED_AT
        .get()
        .map(|t| t.elapsed().as_secs_f64())
        .unwrap_or(0.0)
}
