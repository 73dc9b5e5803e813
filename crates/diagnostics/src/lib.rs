//! Diagnostic collectors and the support-bundle packager.

pub mod bundle;
pub mod collector;
pub mod system;

pub use bundle::{BundleError, DiagnosticService, BUNDLE_SCHEMA_VERSION, BUNDLE_TOTAL_TIMEOUT};
pub use collector::{safe_collect, Collector, CollectorResult, DEFAULT_COLLECTOR_TIMEOUT};
pub use system::{host_id, sanitize_label, SystemCollector};
