//! Collector framework.
//!
//! A collector is a named unit that gathers one map of diagnostic data
//! within a timeout. `safe_collect` is the only way the bundler runs them:
//! failures and timeouts become data, never propagated errors.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};

pub const DEFAULT_COLLECTOR_TIMEOUT: Duration = Duration::from_secs(10);

#[async_trait]
pub trait Collector: Send + Sync {
    fn name(&self) -> &'static str;

    fn timeout(&self) -> Duration {
        DEFAULT_COLLECTOR_TIMEOUT
    }

    async fn collect(&self) -> anyhow::Result<Map<String, Value>>;
}

#[derive(Debug, Clone)]
pub struct CollectorResult {
    pub name: String,
    pub data: Map<String, Value>,
    pub collected_at: String,
    pub duration_ms: f64,
    pub error: Option<String>,
}

/// Run one collector with its timeout enforced. Exceptions and timeouts
/// yield an empty data map and a single-line error description.
pub async fn safe_collect(collector: &dyn Collector) -> CollectorResult {
    let start = Instant::now();
    let timeout = collector.timeout();
    let outcome = tokio::time::timeout(timeout, collector.collect()).await;
    let duration_ms = round1(start.elapsed().as_secs_f64() * 1000.0);
    let collected_at = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);

    match outcome {
        Ok(Ok(data)) => CollectorResult {
            name: collector.name().to_string(),
            data,
            collected_at,
            duration_ms,
            error: None,
        },
        Ok(Err(e)) => {
            tracing::warn!(collector = collector.name(), error = %e, "collector failed");
            CollectorResult {
                name: collector.name().to_string(),
                data: Map::new(),
                collected_at,
                duration_ms,
                error: Some(one_line(&format!("{e:#}"))),
            }
        }
        Err(_) => CollectorResult {
            name: collector.name().to_string(),
            data: Map::new(),
            collected_at,
            duration_ms,
            error: Some(format!(
                "collector timed out after {}s",
                timeout.as_secs_f64()
            )),
        },
    }
}

fn one_line(s: &str) -> String {
    s.replace('\n', " ")
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct OkCollector;

    #[async_trait]
    impl Collector for OkCollector {
        fn name(&self) -> &'static str {
            "ok"
        }

        async fn collect(&self) -> anyhow::Result<Map<String, Value>> {
            let mut data = Map::new();
            data.insert("answer".into(), Value::from(42));
            Ok(data)
        }
    }

    struct FailingCollector;

    #[async_trait]
    impl Collector for FailingCollector {
        fn name(&self) -> &'static str {
            "failing"
        }

        async fn collect(&self) -> anyhow::Result<Map<String, Value>> {
            anyhow::bail!("qdrant refused\nthe connection")
        }
    }

    struct SlowCollector;

    #[async_trait]
    impl Collector for SlowCollector {
        fn name(&self) -> &'static str {
            "slow"
        }

        fn timeout(&self) -> Duration {
            Duration::from_millis(50)
        }

        async fn collect(&self) -> anyhow::Result<Map<String, Value>> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(Map::new())
        }
    }

    #[tokio::test]
    async fn success_carries_data_and_duration() {
        let result = safe_collect(&OkCollector).await;
        assert_eq!(result.name, "ok");
        assert!(result.error.is_none());
        assert_eq!(result.data["answer"], 42);
        assert!(result.collected_at.ends_with('Z'));
    }

    #[tokio::test]
    async fn failure_becomes_single_line_error() {
        let result = safe_collect(&FailingCollector).await;
        assert!(result.data.is_empty());
        let error = result.error.unwrap();
        assert!(error.contains("qdrant refused"));
        assert!(!error.contains('\n'));
    }

    #[tokio::test]
    async fn timeout_is_enforced_per_collector() {
        let start = Instant::now();
        let result = safe_collect(&SlowCollector).await;
        assert!(start.elapsed() < Duration::from_secs(1));
        assert!(result.error.unwrap().contains("timed out"));
        assert!(result.duration_ms >= 50.0);
    }
}
