//! Concrete diagnostic collectors over the application state.
//!
//! Every collector is fault-isolated by `safe_collect`; a failing
//! subsystem shows up as a per-collector error inside the bundle instead
//! of sinking the whole archive.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use vaiz_core::issue_tracker::issue_tracker;
use vaiz_core::logging::log_buffer;
use vaiz_core::redaction::{redact_config, redact_log_entry};
use vaiz_core::{error_registry, Config};
use vaiz_diagnostics::{sanitize_label, Collector, SystemCollector};

use crate::probes::deep_health;
use crate::state::{AppState, TaskRegistry};

/// External connectivity-token service. The control plane consumes only
/// summaries; raw secrets never cross this boundary.
pub trait TokenLister: Send + Sync {
    fn list(&self) -> anyhow::Result<Vec<TokenSummary>>;
}

#[derive(Debug, Clone)]
pub struct TokenSummary {
    pub id: String,
    pub label: String,
    pub revoked: bool,
    pub last_used_at: Option<String>,
    pub request_count: u64,
}

/// The standard collector set for a diagnostic bundle.
pub fn default_collectors(state: &Arc<AppState>) -> Vec<Arc<dyn Collector>> {
    vec![
        Arc::new(HealthCollector {
            state: state.clone(),
        }),
        Arc::new(ConfigCollector {
            config: state.config.clone(),
        }),
        Arc::new(LogCollector),
        Arc::new(SystemCollector),
        Arc::new(QdrantCollector {
            state: state.clone(),
        }),
        Arc::new(DatabaseCollector {
            state: state.clone(),
        }),
        Arc::new(ErrorCollector),
        Arc::new(IssueCollector),
        Arc::new(ProcessCollector {
            tasks: state.tasks.clone(),
        }),
        Arc::new(ConnectivityCollector {
            state: state.clone(),
        }),
    ]
}

// ── health ────────────────────────────────────────────────────────

pub struct HealthCollector {
    pub state: Arc<AppState>,
}

#[async_trait]
impl Collector for HealthCollector {
    fn name(&self) -> &'static str {
        "health"
    }

    async fn collect(&self) -> anyhow::Result<Map<String, Value>> {
        match deep_health(&self.state).await {
            Value::Object(map) => Ok(map),
            other => anyhow::bail!("unexpected deep health shape: {other}"),
        }
    }
}

// ── config ────────────────────────────────────────────────────────

pub struct ConfigCollector {
    pub config: Config,
}

#[async_trait]
impl Collector for ConfigCollector {
    fn name(&self) -> &'static str {
        "config"
    }

    async fn collect(&self) -> anyhow::Result<Map<String, Value>> {
        match redact_config(&self.config.snapshot()) {
            Value::Object(map) => Ok(map),
            other => anyhow::bail!("unexpected config snapshot shape: {other}"),
        }
    }
}

// ── logs ──────────────────────────────────────────────────────────

pub struct LogCollector;

#[async_trait]
impl Collector for LogCollector {
    fn name(&self) -> &'static str {
        "logs"
    }

    async fn collect(&self) -> anyhow::Result<Map<String, Value>> {
        let entries: Vec<Value> = log_buffer()
            .get_entries(1000)
            .iter()
            .map(redact_log_entry)
            .collect();

        let mut data = Map::new();
        data.insert("count".into(), Value::from(entries.len()));
        data.insert("entries".into(), Value::Array(entries));
        Ok(data)
    }
}

// ── qdrant ────────────────────────────────────────────────────────

pub struct QdrantCollector {
    pub state: Arc<AppState>,
}

#[async_trait]
impl Collector for QdrantCollector {
    fn name(&self) -> &'static str {
        "qdrant"
    }

    async fn collect(&self) -> anyhow::Result<Map<String, Value>> {
        let base = self.state.config.qdrant.base_url();
        let body: Value = self
            .state
            .http
            .get(format!("{base}/collections"))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let names: Vec<&str> = body
            .pointer("/result/collections")
            .and_then(Value::as_array)
            .map(|list| {
                list.iter()
                    .filter_map(|c| c.get("name").and_then(Value::as_str))
                    .collect()
            })
            .unwrap_or_default();

        let mut collections = Vec::new();
        for name in &names {
            let info: Value = self
                .state
                .http
                .get(format!("{base}/collections/{name}"))
                .send()
                .await?
                .json()
                .await?;
            collections.push(json!({
                "name": name,
                "points_count": info.pointer("/result/points_count"),
                "status": info.pointer("/result/status"),
            }));
        }

        let mut data = Map::new();
        data.insert("collection_count".into(), Value::from(names.len()));
        data.insert("collections".into(), Value::Array(collections));
        Ok(data)
    }
}

// ── database ──────────────────────────────────────────────────────

pub struct DatabaseCollector {
    pub state: Arc<AppState>,
}

#[async_trait]
impl Collector for DatabaseCollector {
    fn name(&self) -> &'static str {
        "database"
    }

    async fn collect(&self) -> anyhow::Result<Map<String, Value>> {
        let Some(pool) = &self.state.pg_pool else {
            anyhow::bail!("database not configured");
        };
        match crate::db::introspect(pool).await? {
            Value::Object(map) => Ok(map),
            other => anyhow::bail!("unexpected introspection shape: {other}"),
        }
    }
}

// ── errors ────────────────────────────────────────────────────────

pub struct ErrorCollector;

#[async_trait]
impl Collector for ErrorCollector {
    fn name(&self) -> &'static str {
        "errors"
    }

    async fn collect(&self) -> anyhow::Result<Map<String, Value>> {
        let Some(registry) = error_registry() else {
            anyhow::bail!("error registry not initialized");
        };

        let codes: Vec<Value> = registry
            .all_codes()
            .iter()
            .filter_map(|code| registry.get(code))
            .map(|entry| {
                json!({
                    "code": entry.code,
                    "domain": entry.domain,
                    "title": entry.title,
                    "severity": entry.severity.as_str(),
                    "retryable": entry.retryable,
                    "http_status": entry.http_status,
                    "safe_message": entry.safe_message,
                })
            })
            .collect();

        // The most recent 100 error-level records, redacted.
        let recent: Vec<Value> = log_buffer()
            .get_entries(1000)
            .iter()
            .filter(|e| {
                matches!(
                    e.get("level").and_then(Value::as_str),
                    Some("error") | Some("critical")
                )
            })
            .map(redact_log_entry)
            .collect();
        let skip = recent.len().saturating_sub(100);
        let recent: Vec<Value> = recent.into_iter().skip(skip).collect();

        let mut data = Map::new();
        data.insert(
            "registry".into(),
            json!({
                "schema_version": registry.schema_version(),
                "total_codes": registry.len(),
                "codes": codes,
            }),
        );
        data.insert(
            "recent_errors".into(),
            json!({ "count": recent.len(), "entries": recent }),
        );
        Ok(data)
    }
}

// ── issues ────────────────────────────────────────────────────────

pub struct IssueCollector;

#[async_trait]
impl Collector for IssueCollector {
    fn name(&self) -> &'static str {
        "issues"
    }

    async fn collect(&self) -> anyhow::Result<Map<String, Value>> {
        let issues = issue_tracker().get_active_issues();
        let mut data = Map::new();
        data.insert("active_count".into(), Value::from(issues.len()));
        data.insert("issues".into(), serde_json::to_value(issues)?);
        Ok(data)
    }
}

// ── processes ─────────────────────────────────────────────────────

pub struct ProcessCollector {
    pub tasks: Arc<TaskRegistry>,
}

#[async_trait]
impl Collector for ProcessCollector {
    fn name(&self) -> &'static str {
        "processes"
    }

    async fn collect(&self) -> anyhow::Result<Map<String, Value>> {
        let statuses: Vec<Value> = self
            .tasks
            .statuses()
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "done": t.done,
                    "cancelled": t.cancelled,
                })
            })
            .collect();

        let mut data = Map::new();
        data.insert("task_count".into(), Value::from(statuses.len()));
        data.insert("tasks".into(), Value::Array(statuses));
        Ok(data)
    }
}

// ── connectivity ──────────────────────────────────────────────────

pub struct ConnectivityCollector {
    pub state: Arc<AppState>,
}

#[async_trait]
impl Collector for ConnectivityCollector {
    fn name(&self) -> &'static str {
        "connectivity"
    }

    async fn collect(&self) -> anyhow::Result<Map<String, Value>> {
        let mut data = Map::new();
        data.insert(
            "enabled".into(),
            Value::Bool(self.state.token_lister.is_some()),
        );
        data.insert(
            "bind_host".into(),
            Value::String(self.state.config.server.host.clone()),
        );

        // Token labels and usage only; never the secrets themselves.
        match &self.state.token_lister {
            Some(lister) => match lister.list() {
                Ok(tokens) => {
                    let active = tokens.iter().filter(|t| !t.revoked).count();
                    let summaries: Vec<Value> = tokens
                        .iter()
                        .map(|t| {
                            json!({
                                "id": t.id,
                                "label": sanitize_label(&t.label),
                                "is_active": !t.revoked,
                                "last_used_at": t.last_used_at,
                                "request_count": t.request_count,
                            })
                        })
                        .collect();
                    data.insert("token_count".into(), Value::from(tokens.len()));
                    data.insert("active_token_count".into(), Value::from(active));
                    data.insert("tokens".into(), Value::Array(summaries));
                }
                Err(e) => {
                    data.insert("tokens_error".into(), Value::String(e.to_string()));
                }
            },
            None => {
                data.insert(
                    "tokens_error".into(),
                    Value::String("token service unavailable".into()),
                );
            }
        }

        data.insert("metrics".into(), self.state.metrics.snapshot());

        let audit: Vec<Value> = log_buffer()
            .get_entries(500)
            .iter()
            .filter(|e| {
                e.get("audit").and_then(Value::as_str) == Some("connectivity")
                    || e.get("logger")
                        .and_then(Value::as_str)
                        .is_some_and(|l| l.contains("connectivity"))
            })
            .map(redact_log_entry)
            .collect();
        let skip = audit.len().saturating_sub(20);
        data.insert(
            "recent_audit_entries".into(),
            Value::Array(audit.into_iter().skip(skip).collect()),
        );

        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vaiz_diagnostics::safe_collect;

    use crate::test_support::test_state;

    #[tokio::test]
    async fn config_collector_redacts_secrets() {
        let state = test_state(|config, _| {
            config.security.internal_api_key = Some("vz_super_secret_key".into());
            config.postgres.password = Some("hunter2hunter2".into());
        })
        .await;

        let collector = ConfigCollector {
            config: state.config.clone(),
        };
        let data = collector.collect().await.unwrap();
        assert_eq!(data["security"]["internal_api_key"], "vz_s****_key");
        assert_eq!(data["postgres"]["password"], "hunt****ter2");
        // Non-secret fields survive untouched.
        assert_eq!(data["postgres"]["host"], state.config.postgres.host);
    }

    #[tokio::test]
    async fn logs_collector_redacts_entries() {
        let state = test_state(|_, _| {}).await;
        let _ = state;
        log_buffer().push(serde_json::json!({
            "level": "info",
            "message": "user admin@example.com signed in",
            "install_token": "vzit_0123456789",
        }));

        let data = LogCollector.collect().await.unwrap();
        assert!(data["count"].as_u64().unwrap() >= 1);
        let entries = data["entries"].as_array().unwrap();
        let last = entries.last().unwrap();
        assert_eq!(last["message"], "user [REDACTED_EMAIL] signed in");
        assert_eq!(last["install_token"], "vzit****6789");
    }

    #[tokio::test]
    async fn errors_collector_dumps_registry_without_details() {
        let _state = test_state(|_, _| {}).await;
        let data = ErrorCollector.collect().await.unwrap();
        let registry = &data["registry"];
        assert!(registry["total_codes"].as_u64().unwrap() > 5);
        let codes = registry["codes"].as_array().unwrap();
        assert!(codes.iter().all(|c| c.get("detail").is_none()));
    }

    #[tokio::test]
    async fn connectivity_collector_sanitizes_labels() {
        struct StubLister;
        impl TokenLister for StubLister {
            fn list(&self) -> anyhow::Result<Vec<TokenSummary>> {
                Ok(vec![
                    TokenSummary {
                        id: "t1".into(),
                        label: "prod\x00\x1ftoken".into(),
                        revoked: false,
                        last_used_at: None,
                        request_count: 7,
                    },
                    TokenSummary {
                        id: "t2".into(),
                        label: "old".into(),
                        revoked: true,
                        last_used_at: Some("2026-01-01T00:00:00Z".into()),
                        request_count: 0,
                    },
                ])
            }
        }

        let state = test_state(|_, stores| {
            stores.token_lister = Some(Arc::new(StubLister));
        })
        .await;

        let collector = ConnectivityCollector { state };
        let data = collector.collect().await.unwrap();
        assert_eq!(data["token_count"], 2);
        assert_eq!(data["active_token_count"], 1);
        assert_eq!(data["tokens"][0]["label"], "prodtoken");
        assert!(data["metrics"]["requests_total"].is_u64());
    }

    #[tokio::test]
    async fn process_collector_reports_registered_tasks() {
        let state = test_state(|_, _| {}).await;
        state.tasks.spawn("idle", async {
            tokio::time::sleep(std::time::Duration::from_secs(60)).await;
        });

        let collector = ProcessCollector {
            tasks: state.tasks.clone(),
        };
        let result = safe_collect(&collector).await;
        assert!(result.error.is_none());
        let tasks = result.data["tasks"].as_array().unwrap();
        assert!(tasks.iter().any(|t| t["name"] == "idle"));
        state
            .tasks
            .shutdown(std::time::Duration::from_millis(200))
            .await;
    }

    #[tokio::test]
    async fn database_collector_fails_in_isolation_when_unconfigured() {
        let state = test_state(|_, _| {}).await;
        let collector = DatabaseCollector { state };
        let result = safe_collect(&collector).await;
        assert!(result.error.unwrap().contains("not configured"));
        assert!(result.data.is_empty());
    }
}
