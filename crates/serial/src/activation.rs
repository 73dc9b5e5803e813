//! Activation lifecycle: boot-time activation from the bootstrap token,
//! token refresh on version change, and the background status poll loop.

use std::sync::Arc;
use std::time::Duration;

use chrono::{SecondsFormat, Utc};

use crate::client::{ActivateOutcome, RefreshOutcome, SerialClient, StatusOutcome};
use crate::store::{SerialPhase, SerialStore};

pub const STATUS_POLL_INTERVAL: Duration = Duration::from_secs(300);
pub const ACTIVATION_RETRY_INTERVAL: Duration = Duration::from_secs(30);

pub struct ActivationManager {
    store: Arc<SerialStore>,
    client: Arc<SerialClient>,
    instance_id: String,
    hostname: String,
    app_version: String,
    activation_retry: Duration,
    status_poll: Duration,
}

impl ActivationManager {
    pub fn new(
        store: Arc<SerialStore>,
        client: Arc<SerialClient>,
        hostname: &str,
        app_version: &str,
    ) -> Self {
        Self {
            store,
            client,
            instance_id: format!("vz-{hostname}"),
            hostname: hostname.to_string(),
            app_version: app_version.to_string(),
            activation_retry: ACTIVATION_RETRY_INTERVAL,
            status_poll: STATUS_POLL_INTERVAL,
        }
    }

    pub fn with_intervals(mut self, activation_retry: Duration, status_poll: Duration) -> Self {
        self.activation_retry = activation_retry;
        self.status_poll = status_poll;
        self
    }

    /// Boot-time pass, run once before the background loop starts.
    pub async fn startup(&self) {
        match self.store.phase() {
            SerialPhase::Unprovisioned => {
                tracing::info!("serial: unprovisioned, waiting for provisioning");
                return;
            }
            SerialPhase::Migrated => {
                tracing::info!("serial: migrated, ledger metering in effect");
                return;
            }
            SerialPhase::Provisioned => {
                self.attempt_activation().await;
            }
            SerialPhase::Active | SerialPhase::Degraded => {}
        }

        if self.store.phase() == SerialPhase::Active {
            let state = self.store.snapshot();
            let version_changed = state
                .last_app_version
                .as_deref()
                .is_some_and(|v| v != self.app_version);
            if version_changed {
                tracing::info!(
                    from = state.last_app_version.as_deref().unwrap_or(""),
                    to = %self.app_version,
                    "app version changed, refreshing install token"
                );
                self.attempt_refresh().await;
            }
            if let Err(e) = self.store.update_app_version(&self.app_version) {
                tracing::warn!(error = %e, "failed to persist app version");
            }
        }
    }

    /// Background loop. Runs until the owning task is aborted; every await
    /// is a clean cancellation point.
    pub async fn run(self: Arc<Self>) {
        loop {
            let sleep = match self.store.phase() {
                SerialPhase::Provisioned => {
                    self.attempt_activation().await;
                    self.activation_retry
                }
                SerialPhase::Active | SerialPhase::Degraded => {
                    self.poll_status().await;
                    self.status_poll
                }
                SerialPhase::Migrated | SerialPhase::Unprovisioned => self.status_poll,
            };
            tokio::time::sleep(sleep).await;
        }
    }

    async fn attempt_activation(&self) {
        let state = self.store.snapshot();
        let (Some(bootstrap_token), serial) = (state.bootstrap_token.as_deref(), &state.serial)
        else {
            tracing::warn!("cannot activate: missing bootstrap token");
            return;
        };
        if serial.is_empty() {
            tracing::warn!("cannot activate: missing serial");
            return;
        }

        let shown: String = serial.chars().take(16).collect();
        tracing::info!(serial = %shown, "attempting serial activation");

        match self
            .client
            .activate(
                serial,
                bootstrap_token,
                &self.instance_id,
                &self.hostname,
                &self.app_version,
            )
            .await
        {
            ActivateOutcome::Activated { install_token } => {
                if let Err(e) = self.store.transition_to_active(&install_token) {
                    tracing::warn!(error = %e, "failed to persist activation");
                    return;
                }
                if let Err(e) = self.store.update_app_version(&self.app_version) {
                    tracing::warn!(error = %e, "failed to persist app version");
                }
                tracing::info!("serial activated");
            }
            ActivateOutcome::AuthRevoked => {
                tracing::warn!("activation rejected with 401, unprovisioning");
                if let Err(e) = self.store.transition_to_unprovisioned() {
                    tracing::warn!(error = %e, "failed to persist unprovision");
                }
            }
            ActivateOutcome::Rejected { status, error } => {
                tracing::warn!(status, error = %error, "activation failed");
            }
            ActivateOutcome::Unreachable { error } => {
                tracing::warn!(error = %error, "activation failed: authority unreachable");
            }
        }
    }

    async fn attempt_refresh(&self) {
        let state = self.store.snapshot();
        let Some(install_token) = state.install_token.as_deref() else {
            return;
        };

        match self
            .client
            .refresh(&state.serial, install_token, &self.instance_id)
            .await
        {
            RefreshOutcome::Refreshed { install_token } => {
                if let Err(e) = self.store.replace_install_token(&install_token) {
                    tracing::warn!(error = %e, "failed to persist refreshed token");
                } else {
                    tracing::info!("install token refreshed");
                }
            }
            RefreshOutcome::AuthRevoked => {
                tracing::warn!("refresh returned 401, falling back to provisioned");
                if let Err(e) = self.store.fall_back_to_provisioned() {
                    tracing::warn!(error = %e, "failed to persist fallback");
                }
            }
            RefreshOutcome::Rejected { status, error } => {
                tracing::warn!(status, error = %error, "token refresh failed, keeping existing token");
            }
            RefreshOutcome::Unreachable { error } => {
                tracing::warn!(error = %error, "token refresh failed, keeping existing token");
            }
        }
    }

    async fn poll_status(&self) {
        let state = self.store.snapshot();
        if !matches!(state.state, SerialPhase::Active | SerialPhase::Degraded) {
            return;
        }
        let Some(install_token) = state.install_token.as_deref() else {
            return;
        };

        match self.client.status(&state.serial, install_token).await {
            StatusOutcome::Ok {
                data,
                migrated,
                gateway_user_id,
            } => {
                if let Err(e) = self.store.record_success() {
                    tracing::warn!(error = %e, "failed to persist status success");
                }
                let now = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
                if let Err(e) = self.store.update_status_cache(data, &now) {
                    tracing::warn!(error = %e, "failed to persist status cache");
                }
                if migrated {
                    tracing::info!("authority reports migration, switching to ledger metering");
                    if let Err(e) = self
                        .store
                        .transition_to_migrated(gateway_user_id.as_deref())
                    {
                        tracing::warn!(error = %e, "failed to persist migration");
                    }
                }
            }
            StatusOutcome::AuthRevoked => {
                tracing::warn!("status poll returned 401, unprovisioning");
                if let Err(e) = self.store.transition_to_unprovisioned() {
                    tracing::warn!(error = %e, "failed to persist unprovision");
                }
            }
            StatusOutcome::Rejected { status, error } => {
                tracing::warn!(status, error = %error, "status poll failed");
                let _ = self.store.record_failure();
            }
            StatusOutcome::Unreachable { error } => {
                tracing::warn!(error = %error, "status poll failed: authority unreachable");
                let _ = self.store.record_failure();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SerialState;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn manager(store: Arc<SerialStore>, base_url: &str) -> ActivationManager {
        let client = Arc::new(SerialClient::new(
            base_url,
            Some(Duration::from_millis(300)),
        ));
        ActivationManager::new(store, client, "testhost", "1.8.0")
    }

    #[tokio::test]
    async fn startup_activates_provisioned_state() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/serials/VZ-AAAA1111-BBBB2222/activate"))
            .and(body_partial_json(serde_json::json!({
                "bootstrap_token": "vzbt_X",
                "hostname": "testhost",
                "app_version": "1.8.0",
            })))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({ "install_token": "vzit_Y" })),
            )
            .mount(&server)
            .await;

        let store = Arc::new(SerialStore::in_memory(SerialState {
            state: SerialPhase::Provisioned,
            serial: "VZ-AAAA1111-BBBB2222".into(),
            bootstrap_token: Some("vzbt_X".into()),
            ..Default::default()
        }));
        manager(store.clone(), &server.uri()).startup().await;

        let snap = store.snapshot();
        assert_eq!(snap.state, SerialPhase::Active);
        assert_eq!(snap.install_token.as_deref(), Some("vzit_Y"));
        assert!(snap.bootstrap_token.is_none());
        assert_eq!(snap.last_app_version.as_deref(), Some("1.8.0"));
    }

    #[tokio::test]
    async fn startup_unprovisions_on_401() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/serials/VZ-X/activate"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let store = Arc::new(SerialStore::in_memory(SerialState {
            state: SerialPhase::Provisioned,
            serial: "VZ-X".into(),
            bootstrap_token: Some("vzbt".into()),
            ..Default::default()
        }));
        manager(store.clone(), &server.uri()).startup().await;
        assert_eq!(store.phase(), SerialPhase::Unprovisioned);
    }

    #[tokio::test]
    async fn startup_refreshes_on_version_change() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/serials/VZ-X/refresh"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({ "install_token": "vzit_new" })),
            )
            .expect(1)
            .mount(&server)
            .await;

        let store = Arc::new(SerialStore::in_memory(SerialState {
            state: SerialPhase::Active,
            serial: "VZ-X".into(),
            install_token: Some("vzit_old".into()),
            last_app_version: Some("1.7.0".into()),
            ..Default::default()
        }));
        manager(store.clone(), &server.uri()).startup().await;

        let snap = store.snapshot();
        assert_eq!(snap.install_token.as_deref(), Some("vzit_new"));
        assert_eq!(snap.last_app_version.as_deref(), Some("1.8.0"));
    }

    #[tokio::test]
    async fn refresh_401_falls_back_to_provisioned() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/serials/VZ-X/refresh"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let store = Arc::new(SerialStore::in_memory(SerialState {
            state: SerialPhase::Active,
            serial: "VZ-X".into(),
            install_token: Some("vzit_old".into()),
            last_app_version: Some("1.7.0".into()),
            ..Default::default()
        }));
        manager(store.clone(), &server.uri()).startup().await;

        let snap = store.snapshot();
        assert_eq!(snap.state, SerialPhase::Provisioned);
        assert!(snap.install_token.is_none());
    }

    #[tokio::test]
    async fn status_poll_updates_cache_and_detects_migration() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/serials/VZ-X/status"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({
                    "data_remaining_usd": "2.00",
                    "migrated": true,
                    "gateway_user_id": "gw-7",
                })),
            )
            .mount(&server)
            .await;

        let store = Arc::new(SerialStore::in_memory(SerialState {
            state: SerialPhase::Degraded,
            serial: "VZ-X".into(),
            install_token: Some("vzit".into()),
            consecutive_failures: 4,
            ..Default::default()
        }));
        manager(store.clone(), &server.uri()).poll_status().await;

        let snap = store.snapshot();
        assert_eq!(snap.state, SerialPhase::Migrated);
        assert_eq!(snap.consecutive_failures, 0);
        assert_eq!(snap.last_status_cache["data_remaining_usd"], "2.00");
        assert_eq!(snap.last_status_cache["gateway_user_id"], "gw-7");
        assert!(snap.last_status_at.is_some());
    }

    #[tokio::test]
    async fn background_loop_cancels_cleanly() {
        let store = Arc::new(SerialStore::in_memory(SerialState::default()));
        let mgr = Arc::new(
            manager(store, "http://127.0.0.1:1")
                .with_intervals(Duration::from_millis(10), Duration::from_millis(10)),
        );
        let handle = tokio::spawn(mgr.run());
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.abort();
        assert!(handle.await.unwrap_err().is_cancelled());
    }
}
