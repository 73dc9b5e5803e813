//! Deep health probes.
//!
//! Each component check is bounded to two seconds and collapses every
//! failure into `{status: down, detail_safe}` — exception text never
//! reaches a response. Overall status is the worst component.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{SecondsFormat, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::{json, Map, Value};

use crate::state::AppState;

pub const COMPONENT_TIMEOUT: Duration = Duration::from_secs(2);
/// Latency above this marks an otherwise-ok probe degraded.
pub const DEGRADED_LATENCY_MS: f64 = 250.0;

pub const DISK_WARN_PCT: f64 = 15.0;
pub const DISK_CRITICAL_PCT: f64 = 5.0;
pub const MEMORY_WARN_PCT: f64 = 10.0;
pub const MEMORY_CRITICAL_PCT: f64 = 3.0;

/// Run all component probes concurrently and aggregate worst-of.
pub async fn deep_health(state: &Arc<AppState>) -> Value {
    let checks: Vec<(&'static str, BoxFuture<'_, Value>)> = vec![
        ("qdrant", check_qdrant(state).boxed()),
        ("database", check_database(state).boxed()),
        ("llm", check_llm(state).boxed()),
        ("trust_channel", check_trust_channel(state).boxed()),
        ("disk", check_disk(state).boxed()),
        ("memory", check_memory().boxed()),
    ];

    let results = futures::future::join_all(
        checks
            .into_iter()
            .map(|(name, fut)| async move { (name, bounded_check(name, fut).await) }),
    )
    .await;

    let mut components = Map::new();
    for (name, result) in results {
        components.insert(name.to_string(), result);
    }

    let statuses: Vec<&str> = components
        .values()
        .map(|c| c.get("status").and_then(Value::as_str).unwrap_or("down"))
        .collect();
    let overall = if statuses.contains(&"down") {
        "down"
    } else if statuses.contains(&"degraded") {
        "degraded"
    } else {
        "ok"
    };

    json!({
        "status": overall,
        "checked_at": Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        "version": vaiz_core::APP_VERSION,
        "uptime_s": round1(vaiz_core::uptime_s()),
        "components": components,
    })
}

async fn bounded_check(name: &str, fut: BoxFuture<'_, Value>) -> Value {
    match tokio::time::timeout(COMPONENT_TIMEOUT, fut).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!(component = name, "health probe timed out");
            json!({ "status": "down", "detail_safe": "Health check timed out" })
        }
    }
}

async fn check_qdrant(state: &Arc<AppState>) -> Value {
    let url = format!("{}/collections", state.config.qdrant.base_url());
    let start = Instant::now();
    let result = state
        .http
        .get(&url)
        .timeout(COMPONENT_TIMEOUT)
        .send()
        .await;
    let latency_ms = elapsed_ms(start);

    match result {
        Ok(resp) if resp.status().is_success() => {
            let collections = resp
                .json::<Value>()
                .await
                .ok()
                .and_then(|v| {
                    v.pointer("/result/collections")
                        .and_then(Value::as_array)
                        .map(|a| a.len())
                })
                .unwrap_or(0);
            let status = if latency_ms > DEGRADED_LATENCY_MS { "degraded" } else { "ok" };
            json!({
                "status": status,
                "latency_ms": latency_ms,
                "detail_safe": format!("{collections} collections"),
            })
        }
        Ok(resp) => json!({
            "status": "down",
            "latency_ms": latency_ms,
            "detail_safe": format!("HTTP {}", resp.status().as_u16()),
        }),
        Err(_) => json!({
            "status": "down",
            "latency_ms": latency_ms,
            "detail_safe": "Connection failed: RequestError",
        }),
    }
}

async fn check_database(state: &Arc<AppState>) -> Value {
    let Some(pool) = &state.pg_pool else {
        return json!({ "status": "down", "detail_safe": "Database not configured" });
    };
    let start = Instant::now();
    match crate::db::select_one(pool).await {
        Ok(()) => {
            let latency_ms = elapsed_ms(start);
            let status = if latency_ms > DEGRADED_LATENCY_MS { "degraded" } else { "ok" };
            json!({ "status": status, "latency_ms": latency_ms })
        }
        Err(_) => json!({
            "status": "down",
            "latency_ms": elapsed_ms(start),
            "detail_safe": "Query failed: DatabaseError",
        }),
    }
}

async fn check_llm(state: &Arc<AppState>) -> Value {
    if state.config.llm.is_configured() {
        json!({
            "status": "ok",
            "detail_safe": format!("Provider: {}", state.config.llm.provider),
        })
    } else {
        json!({ "status": "down", "detail_safe": "API key not configured" })
    }
}

async fn check_trust_channel(state: &Arc<AppState>) -> Value {
    let Some(keystore) = state.keystore.clone() else {
        return json!({ "status": "down", "detail_safe": "Keystore passphrase not set" });
    };
    let present = tokio::task::spawn_blocking(move || keystore.keys_present())
        .await
        .unwrap_or(false);
    if present {
        json!({ "status": "ok" })
    } else {
        json!({ "status": "down", "detail_safe": "No keypairs available" })
    }
}

async fn check_disk(state: &Arc<AppState>) -> Value {
    let data_dir = state.config.storage.data_dir.clone();
    let free_pct = tokio::task::spawn_blocking(move || {
        vaiz_diagnostics::system::disk_free_pct(&data_dir)
    })
    .await
    .ok()
    .flatten();

    match free_pct {
        Some(free_pct) => {
            let status = if free_pct < DISK_CRITICAL_PCT {
                "down"
            } else if free_pct < DISK_WARN_PCT {
                "degraded"
            } else {
                "ok"
            };
            json!({ "status": status, "free_pct": free_pct })
        }
        None => json!({ "status": "down", "detail_safe": "Disk check failed" }),
    }
}

async fn check_memory() -> Value {
    let avail_pct =
        tokio::task::spawn_blocking(vaiz_diagnostics::system::memory_available_pct).await;
    match avail_pct {
        Ok(avail_pct) => {
            let status = if avail_pct < MEMORY_CRITICAL_PCT {
                "down"
            } else if avail_pct < MEMORY_WARN_PCT {
                "degraded"
            } else {
                "ok"
            };
            json!({ "status": status, "avail_pct": avail_pct })
        }
        Err(_) => json!({ "status": "down", "detail_safe": "Memory check failed" }),
    }
}

fn elapsed_ms(start: Instant) -> f64 {
    round1(start.elapsed().as_secs_f64() * 1000.0)
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}
