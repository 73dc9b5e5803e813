//! Metering policy over the serial state machine.
//!
//! Two strategies behind one operation: serial metering against the
//! authority while the install is pre-migration, and ledger metering
//! (always allow, billed downstream) once migrated. Denial is signalled
//! exclusively through `MeteringError` — there is no soft return channel.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::client::{MeterOutcome, SerialClient};
use crate::offline_queue::{OfflineQueue, PendingMeterEvent};
use crate::store::{SerialPhase, SerialStore};

/// Views whose copilot traffic bills as setup work.
const SETUP_VIEWS: &[&str] = &[
    "onboarding",
    "setup",
    "connectivity",
    "metadata_builder",
    "publish",
];

pub const DEFAULT_OFFLINE_DATA_FAILURE_LIMIT: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeterCategory {
    Setup,
    Data,
}

impl MeterCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Setup => "setup",
            Self::Data => "data",
        }
    }

    /// Default cost in USD when the caller does not override it.
    pub fn default_cost_usd(&self) -> &'static str {
        match self {
            Self::Setup => "0.01",
            Self::Data => "0.03",
        }
    }
}

impl std::fmt::Display for MeterCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify copilot traffic by the active UI view. Unknown or absent views
/// bill as data.
pub fn classify_copilot_category(active_view: Option<&str>) -> MeterCategory {
    match active_view {
        Some(view) if SETUP_VIEWS.contains(&view) => MeterCategory::Setup,
        _ => MeterCategory::Data,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MeterDecision {
    pub allowed: bool,
    pub category: MeterCategory,
    pub offline: bool,
    pub reason: Option<String>,
}

impl MeterDecision {
    fn allowed(category: MeterCategory) -> Self {
        Self {
            allowed: true,
            category,
            offline: false,
            reason: None,
        }
    }

    fn allowed_offline(category: MeterCategory, reason: Option<&str>) -> Self {
        Self {
            allowed: true,
            category,
            offline: true,
            reason: reason.map(String::from),
        }
    }
}

#[derive(Debug, Error)]
pub enum MeteringError {
    #[error("enter serial to continue")]
    Unprovisioned,

    #[error("activation required")]
    ActivationRequired,

    #[error("credit exhausted: {reason}")]
    CreditExhausted {
        category: MeterCategory,
        reason: String,
        remaining_usd: String,
        setup_remaining_usd: String,
        payment_enabled: bool,
        serial: String,
    },
}

impl MeteringError {
    fn exhausted_offline(category: MeterCategory, serial: &str) -> Self {
        Self::CreditExhausted {
            category,
            reason: "offline_data_blocked".into(),
            remaining_usd: "0.00".into(),
            setup_remaining_usd: "0.00".into(),
            payment_enabled: false,
            serial: serial.to_string(),
        }
    }
}

#[async_trait]
pub trait MeteringStrategy: Send + Sync {
    async fn check_and_meter(
        &self,
        category: MeterCategory,
        estimated_cost: &str,
        request_id: &str,
    ) -> Result<MeterDecision, MeteringError>;
}

// ── Serial strategy (pre-migration) ───────────────────────────────

pub struct SerialMeteringStrategy {
    store: Arc<SerialStore>,
    client: Arc<SerialClient>,
    queue: Arc<OfflineQueue>,
    offline_data_failure_limit: u32,
}

impl SerialMeteringStrategy {
    pub fn new(
        store: Arc<SerialStore>,
        client: Arc<SerialClient>,
        queue: Arc<OfflineQueue>,
        offline_data_failure_limit: u32,
    ) -> Self {
        Self {
            store,
            client,
            queue,
            offline_data_failure_limit,
        }
    }

    fn enqueue_offline(
        &self,
        category: MeterCategory,
        cost: &str,
        request_id: &str,
        description: &str,
    ) {
        let event = PendingMeterEvent::new(category.as_str(), cost, request_id, description);
        if let Err(e) = self.queue.append(&event) {
            tracing::warn!(error = %e, "failed to enqueue offline meter event");
        }
    }
}

#[async_trait]
impl MeteringStrategy for SerialMeteringStrategy {
    async fn check_and_meter(
        &self,
        category: MeterCategory,
        estimated_cost: &str,
        request_id: &str,
    ) -> Result<MeterDecision, MeteringError> {
        let state = self.store.snapshot();

        match state.state {
            SerialPhase::Unprovisioned => return Err(MeteringError::Unprovisioned),

            // Setup work is allowed offline before activation completes;
            // data work needs a live authority.
            SerialPhase::Provisioned => {
                return if category == MeterCategory::Setup {
                    self.enqueue_offline(category, estimated_cost, request_id, "provisioned-offline");
                    Ok(MeterDecision::allowed_offline(category, None))
                } else {
                    Err(MeteringError::ActivationRequired)
                };
            }

            SerialPhase::Degraded => {
                return if category == MeterCategory::Setup {
                    self.enqueue_offline(category, estimated_cost, request_id, "degraded-offline");
                    Ok(MeterDecision::allowed_offline(category, None))
                } else {
                    Err(MeteringError::exhausted_offline(category, &state.serial))
                };
            }

            SerialPhase::Migrated => {
                // The guard swaps in the ledger strategy before this point.
                return Ok(MeterDecision::allowed(category));
            }

            SerialPhase::Active => {}
        }

        let Some(install_token) = state.install_token.as_deref() else {
            return Err(MeteringError::ActivationRequired);
        };

        let outcome = self
            .client
            .meter(
                &state.serial,
                install_token,
                category.as_str(),
                estimated_cost,
                request_id,
                "",
            )
            .await;

        match outcome {
            MeterOutcome::Migrated => {
                if let Err(e) = self.store.transition_to_migrated(None) {
                    tracing::warn!(error = %e, "failed to persist migration");
                }
                Ok(MeterDecision::allowed(category))
            }

            MeterOutcome::Allowed(_) => {
                if let Err(e) = self.store.record_success() {
                    tracing::warn!(error = %e, "failed to persist meter success");
                }
                Ok(MeterDecision::allowed(category))
            }

            // An authoritative denial is still a successful authority
            // interaction: the counter resets even though the request is
            // refused.
            MeterOutcome::Denied(denial) => {
                if let Err(e) = self.store.record_success() {
                    tracing::warn!(error = %e, "failed to persist meter success");
                }
                let cached = self.store.snapshot().last_status_cache;
                let setup_remaining = cached
                    .get("setup_remaining_usd")
                    .and_then(Value::as_str)
                    .unwrap_or("0.00")
                    .to_string();
                Err(MeteringError::CreditExhausted {
                    category,
                    reason: denial
                        .reason
                        .unwrap_or_else(|| format!("insufficient_{category}_credits")),
                    remaining_usd: denial.remaining_usd,
                    setup_remaining_usd: setup_remaining,
                    payment_enabled: denial.payment_enabled,
                    serial: state.serial,
                })
            }

            MeterOutcome::AuthRevoked => {
                if let Err(e) = self.store.transition_to_unprovisioned() {
                    tracing::warn!(error = %e, "failed to persist unprovision");
                }
                Err(MeteringError::ActivationRequired)
            }

            outcome @ (MeterOutcome::Rejected { .. } | MeterOutcome::Unreachable { .. }) => {
                let (status, error) = match &outcome {
                    MeterOutcome::Rejected { status, error } => (*status, error.clone()),
                    MeterOutcome::Unreachable { error } => (0u16, error.clone()),
                    _ => unreachable!(),
                };
                tracing::warn!(status, error = %error, "meter call failed, applying offline policy");
                let failures = self.store.record_failure().unwrap_or(u32::MAX);

                if category == MeterCategory::Setup {
                    self.enqueue_offline(
                        category,
                        estimated_cost,
                        request_id,
                        "network-failure-offline",
                    );
                    return Ok(MeterDecision::allowed_offline(category, None));
                }

                // The counter has already absorbed this failure; the limit
                // is compared against the incremented value.
                if failures < self.offline_data_failure_limit {
                    Ok(MeterDecision::allowed_offline(category, Some("transient_offline")))
                } else {
                    Err(MeteringError::exhausted_offline(category, &state.serial))
                }
            }
        }
    }
}

// ── Ledger strategy (post-migration) ──────────────────────────────

/// After migration every operation is allowed; billing happens in the
/// gateway ledger outside this process.
pub struct LedgerMeteringStrategy;

#[async_trait]
impl MeteringStrategy for LedgerMeteringStrategy {
    async fn check_and_meter(
        &self,
        category: MeterCategory,
        _estimated_cost: &str,
        _request_id: &str,
    ) -> Result<MeterDecision, MeteringError> {
        Ok(MeterDecision::allowed(category))
    }
}

// ── Idempotent request IDs ────────────────────────────────────────

/// `vz:{serial_short8}:{md5(endpoint)[..8]}:{millis}` — the authority
/// deduplicates on this string, so a replay after a transport failure must
/// reuse it verbatim.
pub fn make_request_id(serial: &str, endpoint: &str) -> String {
    let serial_short: String = if serial.starts_with("VZ-") {
        serial.chars().skip(3).take(8).collect()
    } else {
        serial.chars().take(8).collect()
    };
    let endpoint_hash = format!("{:x}", md5::compute(endpoint.as_bytes()));
    let ts_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    format!("vz:{}:{}:{}", serial_short, &endpoint_hash[..8], ts_ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{SerialState, SerialStore};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn active_store(serial: &str) -> Arc<SerialStore> {
        Arc::new(SerialStore::in_memory(SerialState {
            state: SerialPhase::Active,
            serial: serial.into(),
            install_token: Some("vzit_token".into()),
            ..Default::default()
        }))
    }

    fn strategy_with(
        store: Arc<SerialStore>,
        base_url: &str,
        queue_dir: &std::path::Path,
    ) -> (SerialMeteringStrategy, Arc<OfflineQueue>) {
        let queue = Arc::new(OfflineQueue::new(queue_dir.join("queue.jsonl")));
        let client = Arc::new(SerialClient::new(
            base_url,
            Some(std::time::Duration::from_millis(300)),
        ));
        (
            SerialMeteringStrategy::new(
                store,
                client,
                queue.clone(),
                DEFAULT_OFFLINE_DATA_FAILURE_LIMIT,
            ),
            queue,
        )
    }

    #[test]
    fn copilot_classifier() {
        assert_eq!(classify_copilot_category(Some("onboarding")), MeterCategory::Setup);
        assert_eq!(classify_copilot_category(Some("publish")), MeterCategory::Setup);
        assert_eq!(classify_copilot_category(Some("search")), MeterCategory::Data);
        assert_eq!(classify_copilot_category(None), MeterCategory::Data);
    }

    #[test]
    fn request_id_shape() {
        let rid = make_request_id("VZ-AAAA1111-BBBB2222", "POST:/api/upload");
        let parts: Vec<&str> = rid.split(':').collect();
        assert_eq!(parts[0], "vz");
        assert_eq!(parts[1], "AAAA1111");
        assert_eq!(parts[2].len(), 8);
        assert!(parts[3].parse::<u128>().is_ok());

        // Same endpoint hashes identically; the timestamp is the only
        // varying component.
        let again = make_request_id("VZ-AAAA1111-BBBB2222", "POST:/api/upload");
        assert_eq!(
            rid.rsplit_once(':').unwrap().0.len(),
            again.rsplit_once(':').unwrap().0.len()
        );
        assert_eq!(rid.split(':').nth(2), again.split(':').nth(2));
    }

    #[tokio::test]
    async fn unprovisioned_blocks_everything() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(SerialStore::in_memory(SerialState::default()));
        let (strategy, _) = strategy_with(store, "http://127.0.0.1:1", tmp.path());

        for category in [MeterCategory::Setup, MeterCategory::Data] {
            let err = strategy
                .check_and_meter(category, category.default_cost_usd(), "vz:r")
                .await
                .unwrap_err();
            assert!(matches!(err, MeteringError::Unprovisioned));
        }
    }

    #[tokio::test]
    async fn degraded_allows_setup_offline_and_blocks_data() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(SerialStore::in_memory(SerialState {
            state: SerialPhase::Degraded,
            serial: "VZ-AAAA1111-BBBB2222".into(),
            install_token: Some("vzit".into()),
            ..Default::default()
        }));
        let (strategy, queue) = strategy_with(store, "http://127.0.0.1:1", tmp.path());

        let decision = strategy
            .check_and_meter(MeterCategory::Setup, "0.01", "vz:setup:1")
            .await
            .unwrap();
        assert!(decision.allowed && decision.offline);

        let pending = queue.pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].category, "setup");
        assert_eq!(pending[0].cost_usd, "0.01");
        assert_eq!(pending[0].request_id, "vz:setup:1");
        assert_eq!(pending[0].description, "degraded-offline");

        let err = strategy
            .check_and_meter(MeterCategory::Data, "0.03", "vz:data:1")
            .await
            .unwrap_err();
        match err {
            MeteringError::CreditExhausted { reason, serial, .. } => {
                assert_eq!(reason, "offline_data_blocked");
                assert_eq!(serial, "VZ-AAAA1111-BBBB2222");
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn provisioned_data_requires_activation() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(SerialStore::in_memory(SerialState {
            state: SerialPhase::Provisioned,
            serial: "VZ-X".into(),
            bootstrap_token: Some("vzbt".into()),
            ..Default::default()
        }));
        let (strategy, queue) = strategy_with(store, "http://127.0.0.1:1", tmp.path());

        let err = strategy
            .check_and_meter(MeterCategory::Data, "0.03", "vz:r")
            .await
            .unwrap_err();
        assert!(matches!(err, MeteringError::ActivationRequired));

        strategy
            .check_and_meter(MeterCategory::Setup, "0.01", "vz:r2")
            .await
            .unwrap();
        assert_eq!(queue.pending()[0].description, "provisioned-offline");
    }

    #[tokio::test]
    async fn denial_resets_counter_and_raises_exhausted() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/serials/VZ-TEST/meter"))
            .respond_with(
                ResponseTemplate::new(402).set_body_json(serde_json::json!({
                    "allowed": false,
                    "remaining_usd": "0.00",
                    "reason": "insufficient_data_credits",
                    "payment_enabled": false,
                })),
            )
            .mount(&server)
            .await;

        let tmp = tempfile::tempdir().unwrap();
        let store = active_store("VZ-TEST");
        // Pre-existing failures must be cleared by the authoritative reply.
        store.record_failure().unwrap();
        let (strategy, _) = strategy_with(store.clone(), &server.uri(), tmp.path());

        let err = strategy
            .check_and_meter(MeterCategory::Data, "0.03", "vz:r")
            .await
            .unwrap_err();
        match err {
            MeteringError::CreditExhausted {
                category,
                reason,
                remaining_usd,
                ..
            } => {
                assert_eq!(category, MeterCategory::Data);
                assert_eq!(reason, "insufficient_data_credits");
                assert_eq!(remaining_usd, "0.00");
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
        assert_eq!(store.snapshot().consecutive_failures, 0);
    }

    #[tokio::test]
    async fn migrated_meter_response_transitions_store() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/serials/VZ-TEST/meter"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({ "allowed": true, "migrated": true })),
            )
            .mount(&server)
            .await;

        let tmp = tempfile::tempdir().unwrap();
        let store = active_store("VZ-TEST");
        let (strategy, _) = strategy_with(store.clone(), &server.uri(), tmp.path());

        let decision = strategy
            .check_and_meter(MeterCategory::Data, "0.03", "vz:r")
            .await
            .unwrap();
        assert!(decision.allowed);
        assert_eq!(store.phase(), SerialPhase::Migrated);
    }

    #[tokio::test]
    async fn meter_401_unprovisions() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/serials/VZ-TEST/meter"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let tmp = tempfile::tempdir().unwrap();
        let store = active_store("VZ-TEST");
        let (strategy, _) = strategy_with(store.clone(), &server.uri(), tmp.path());

        let err = strategy
            .check_and_meter(MeterCategory::Data, "0.03", "vz:r")
            .await
            .unwrap_err();
        assert!(matches!(err, MeteringError::ActivationRequired));
        assert_eq!(store.phase(), SerialPhase::Unprovisioned);
    }

    #[tokio::test]
    async fn network_failure_offline_policy() {
        let tmp = tempfile::tempdir().unwrap();
        let store = active_store("VZ-TEST");
        let (strategy, queue) = strategy_with(store.clone(), "http://127.0.0.1:1", tmp.path());

        // Setup: enqueued and allowed.
        let decision = strategy
            .check_and_meter(MeterCategory::Setup, "0.01", "vz:s")
            .await
            .unwrap();
        assert!(decision.offline);
        assert_eq!(queue.pending()[0].description, "network-failure-offline");

        // Data: allowed while under the post-increment limit (failures are
        // now 2 and 3; the third failure blocks).
        let decision = strategy
            .check_and_meter(MeterCategory::Data, "0.03", "vz:d1")
            .await
            .unwrap();
        assert!(decision.offline);
        assert_eq!(decision.reason.as_deref(), Some("transient_offline"));

        let err = strategy
            .check_and_meter(MeterCategory::Data, "0.03", "vz:d2")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            MeteringError::CreditExhausted { ref reason, .. } if reason == "offline_data_blocked"
        ));
        assert_eq!(store.snapshot().consecutive_failures, 3);
    }

    #[tokio::test]
    async fn ledger_strategy_always_allows() {
        let decision = LedgerMeteringStrategy
            .check_and_meter(MeterCategory::Data, "0.03", "vz:r")
            .await
            .unwrap();
        assert!(decision.allowed);
        assert!(!decision.offline);
    }
}
