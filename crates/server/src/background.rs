//! Background tasks: offline meter queue replay and the software version
//! check.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;

use vaiz_serial::{MeterOutcome, SerialPhase};

use crate::state::AppState;

pub const QUEUE_REPLAY_INTERVAL: Duration = Duration::from_secs(60);

/// Replay pending offline meter events once the machine is ACTIVE. Each
/// event keeps its original request id, so the authority deduplicates
/// anything that was already counted.
pub async fn meter_queue_processor(state: Arc<AppState>) {
    loop {
        tokio::time::sleep(QUEUE_REPLAY_INTERVAL).await;
        replay_once(&state).await;
    }
}

pub async fn replay_once(state: &Arc<AppState>) {
    let snapshot = state.serial_store.snapshot();
    if snapshot.state != SerialPhase::Active {
        return;
    }
    let Some(install_token) = snapshot.install_token.as_deref() else {
        return;
    };
    if state.offline_queue.count() == 0 {
        return;
    }

    let events = match state.offline_queue.drain() {
        Ok(events) => events,
        Err(e) => {
            tracing::warn!(error = %e, "failed to drain offline meter queue");
            return;
        }
    };
    tracing::info!(count = events.len(), "replaying offline meter events");

    let mut replayed = 0usize;
    for (i, event) in events.iter().enumerate() {
        let outcome = state
            .serial_client
            .meter(
                &snapshot.serial,
                install_token,
                &event.category,
                &event.cost_usd,
                &event.request_id,
                &event.description,
            )
            .await;

        match outcome {
            // Any authoritative reply settles the event, including a
            // denial: the charge was either counted or refused for good.
            MeterOutcome::Allowed(_) | MeterOutcome::Denied(_) | MeterOutcome::Migrated => {
                replayed += 1;
            }
            MeterOutcome::AuthRevoked => {
                tracing::warn!("offline replay hit 401, requeueing remainder");
                if let Err(e) = state.offline_queue.requeue(&events[i..]) {
                    tracing::warn!(error = %e, "failed to requeue offline meter events");
                }
                return;
            }
            MeterOutcome::Rejected { .. } | MeterOutcome::Unreachable { .. } => {
                if let Err(e) = state.offline_queue.requeue(&events[i..]) {
                    tracing::warn!(error = %e, "failed to requeue offline meter events");
                }
                tracing::info!(
                    replayed,
                    requeued = events.len() - i,
                    "offline replay interrupted, will retry"
                );
                return;
            }
        }
    }
    tracing::info!(replayed, "offline meter queue drained");
}

// ── Version check ─────────────────────────────────────────────────

const VERSION_CACHE_TTL: Duration = Duration::from_secs(6 * 60 * 60);

/// Periodically refresh the latest-version cache from the release feed.
pub async fn version_check_loop(state: Arc<AppState>) {
    let interval = Duration::from_secs(state.config.update.check_interval_secs.max(60));
    loop {
        if let Err(e) = check_for_updates(&state, false).await {
            tracing::warn!(error = %e, "version check failed");
        }
        tokio::time::sleep(interval).await;
    }
}

/// Current/latest version info, served from cache unless stale or forced.
pub async fn check_for_updates(
    state: &Arc<AppState>,
    force: bool,
) -> anyhow::Result<serde_json::Value> {
    let Some(feed_url) = state.config.update.feed_url.clone() else {
        return Ok(version_body(None));
    };

    let cached = state.version_cache.lock().unwrap().clone();
    let fresh = cached
        .checked_at
        .is_some_and(|at| at.elapsed() < VERSION_CACHE_TTL);
    if !force && fresh {
        return Ok(version_body(cached.latest_version.as_deref()));
    }

    let body: Value = state
        .http
        .get(&feed_url)
        .timeout(Duration::from_secs(10))
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;

    let latest = body
        .get("tags")
        .and_then(Value::as_array)
        .map(|tags| {
            tags.iter()
                .filter_map(Value::as_str)
                .filter_map(|t| parse_semver(t).map(|v| (v, t)))
                .max()
                .map(|(_, t)| t.to_string())
        })
        .unwrap_or_else(|| {
            body.get("latest")
                .and_then(Value::as_str)
                .map(String::from)
        });

    {
        let mut cache = state.version_cache.lock().unwrap();
        cache.latest_version = latest.clone();
        cache.checked_at = Some(Instant::now());
    }
    Ok(version_body(latest.as_deref()))
}

fn version_body(latest: Option<&str>) -> serde_json::Value {
    let current = vaiz_core::APP_VERSION;
    let update_available = match (parse_semver(current), latest.and_then(parse_semver)) {
        (Some(cur), Some(latest)) => latest > cur,
        _ => false,
    };
    serde_json::json!({
        "current_version": current,
        "latest_version": latest,
        "update_available": update_available,
    })
}

fn parse_semver(tag: &str) -> Option<(u64, u64, u64)> {
    let mut parts = tag.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    let patch = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some((major, minor, patch))
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use vaiz_serial::{SerialState, SerialStore};

    use crate::test_support::test_state;

    #[test]
    fn semver_ordering() {
        assert!(parse_semver("2.0.0") > parse_semver("1.9.9"));
        assert_eq!(parse_semver("1.8.0"), Some((1, 8, 0)));
        assert_eq!(parse_semver("1.8"), None);
        assert_eq!(parse_semver("v1.8.0"), None);
    }

    #[tokio::test]
    async fn replay_settles_events_against_the_authority() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/serials/VZ-TEST/meter"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({ "allowed": true })),
            )
            .expect(2)
            .mount(&server)
            .await;

        let uri = server.uri();
        let state = test_state(move |config, stores| {
            config.mode = "connected".into();
            config.authority.base_url = uri;
            stores.serial_store = Arc::new(SerialStore::in_memory(SerialState {
                state: SerialPhase::Active,
                serial: "VZ-TEST".into(),
                install_token: Some("vzit".into()),
                ..Default::default()
            }));
        })
        .await;

        for i in 0..2 {
            state
                .offline_queue
                .append(&vaiz_serial::PendingMeterEvent::new(
                    "setup",
                    "0.01",
                    &format!("vz:replay:{i}"),
                    "degraded-offline",
                ))
                .unwrap();
        }

        replay_once(&state).await;
        assert_eq!(state.offline_queue.count(), 0);
    }

    #[tokio::test]
    async fn replay_requeues_on_authority_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/serials/VZ-TEST/meter"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let uri = server.uri();
        let state = test_state(move |config, stores| {
            config.mode = "connected".into();
            config.authority.base_url = uri;
            stores.serial_store = Arc::new(SerialStore::in_memory(SerialState {
                state: SerialPhase::Active,
                serial: "VZ-TEST".into(),
                install_token: Some("vzit".into()),
                ..Default::default()
            }));
        })
        .await;

        state
            .offline_queue
            .append(&vaiz_serial::PendingMeterEvent::new(
                "setup", "0.01", "vz:r1", "x",
            ))
            .unwrap();
        replay_once(&state).await;
        assert_eq!(state.offline_queue.count(), 1);
    }

    #[tokio::test]
    async fn version_check_uses_feed_and_cache() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/tags/list"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "tags": ["1.7.0", "2.0.1", "latest", "2.0.0"]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let feed = format!("{}/tags/list", server.uri());
        let state = test_state(move |config, _| {
            config.update.feed_url = Some(feed);
        })
        .await;

        let info = check_for_updates(&state, false).await.unwrap();
        assert_eq!(info["latest_version"], "2.0.1");
        assert_eq!(info["update_available"], true);

        // Second call is served from cache (mock expects exactly one hit).
        let cached = check_for_updates(&state, false).await.unwrap();
        assert_eq!(cached["latest_version"], "2.0.1");
    }

    #[tokio::test]
    async fn version_check_disabled_without_feed() {
        let state = test_state(|config, _| {
            config.update.feed_url = None;
        })
        .await;
        let info = check_for_updates(&state, true).await.unwrap();
        assert_eq!(info["current_version"], vaiz_core::APP_VERSION);
        assert!(info["latest_version"].is_null());
        assert_eq!(info["update_available"], false);
    }
}
