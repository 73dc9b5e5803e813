//! Diagnostic bundle service.
//!
//! Runs every collector concurrently under one wall-clock cap, then
//! packages the results into an in-memory zip archive. Nothing is written
//! to disk.

use std::io::{Cursor, Write};
use std::sync::Arc;
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use serde_json::{json, Map, Value};
use thiserror::Error;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::collector::{safe_collect, Collector, CollectorResult};
use crate::system::host_id;

pub const BUNDLE_SCHEMA_VERSION: u32 = 1;
pub const BUNDLE_TOTAL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum BundleError {
    #[error("bundle generation timed out after {}s", BUNDLE_TOTAL_TIMEOUT.as_secs())]
    Timeout,

    #[error("bundle packaging failed: {0}")]
    Package(#[from] zip::result::ZipError),

    #[error("bundle packaging task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Collects system diagnostics into a downloadable zip bundle.
pub struct DiagnosticService {
    collectors: Vec<Arc<dyn Collector>>,
}

impl DiagnosticService {
    pub fn new(collectors: Vec<Arc<dyn Collector>>) -> Self {
        Self { collectors }
    }

    /// Run all collectors and package the archive. The archive bytes are
    /// ready to stream as `application/zip`.
    pub async fn generate_bundle(&self) -> Result<Vec<u8>, BundleError> {
        let results = tokio::time::timeout(BUNDLE_TOTAL_TIMEOUT, self.run_collectors())
            .await
            .map_err(|_| BundleError::Timeout)?;

        let bytes = tokio::task::spawn_blocking(move || package_zip(&results)).await??;
        Ok(bytes)
    }

    async fn run_collectors(&self) -> Vec<CollectorResult> {
        let futures = self
            .collectors
            .iter()
            .map(|c| async move { safe_collect(c.as_ref()).await });
        futures::future::join_all(futures).await
    }
}

fn package_zip(results: &[CollectorResult]) -> Result<Vec<u8>, zip::result::ZipError> {
    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    let metadata = json!({
        "bundle_version": BUNDLE_SCHEMA_VERSION,
        "generated_at": Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        "vectoraiz_version": vaiz_core::APP_VERSION,
        "host_id": host_id(),
    });
    write_entry(&mut zip, "metadata.json", &to_pretty(&metadata), options)?;

    for result in results {
        let mut content = result.data.clone();
        if let Some(error) = &result.error {
            content.insert("_collector_error".into(), Value::String(error.clone()));
        }
        content.insert(
            "_collector_duration_ms".into(),
            Value::from(result.duration_ms),
        );
        content.insert(
            "_collected_at".into(),
            Value::String(result.collected_at.clone()),
        );

        if result.name == "logs" {
            // Log entries ship as NDJSON for streaming parsers; the rest of
            // the collector body becomes the summary.
            let entries = match content.remove("entries") {
                Some(Value::Array(entries)) => entries,
                _ => Vec::new(),
            };
            let mut ndjson = String::new();
            for entry in &entries {
                ndjson.push_str(&entry.to_string());
                ndjson.push('\n');
            }
            write_entry(&mut zip, "logs/recent.jsonl", &ndjson, options)?;
            write_entry(
                &mut zip,
                "logs/summary.json",
                &to_pretty(&Value::Object(content)),
                options,
            )?;
        } else {
            write_entry(
                &mut zip,
                &collector_path(&result.name),
                &to_pretty(&Value::Object(content)),
                options,
            )?;
        }
    }

    let mut summary = Map::new();
    for result in results {
        summary.insert(
            result.name.clone(),
            json!({
                "duration_ms": result.duration_ms,
                "error": result.error,
                "collected_at": result.collected_at,
            }),
        );
    }
    write_entry(
        &mut zip,
        "collector_summary.json",
        &to_pretty(&Value::Object(summary)),
        options,
    )?;

    let cursor = zip.finish()?;
    Ok(cursor.into_inner())
}

fn write_entry(
    zip: &mut ZipWriter<Cursor<Vec<u8>>>,
    name: &str,
    content: &str,
    options: SimpleFileOptions,
) -> Result<(), zip::result::ZipError> {
    zip.start_file(name, options)?;
    zip.write_all(content.as_bytes())
        .map_err(zip::result::ZipError::Io)?;
    Ok(())
}

/// Map collector name → archive path. Unknown collectors land at the root.
fn collector_path(name: &str) -> String {
    match name {
        "health" => "health/health_snapshot.json".to_string(),
        "config" => "config/redacted_config.json".to_string(),
        "system" => "system/runtime.json".to_string(),
        "qdrant" => "qdrant/collections.json".to_string(),
        "database" => "db/schema_version.json".to_string(),
        "errors" => "errors/registry.json".to_string(),
        "issues" => "issues.json".to_string(),
        "processes" => "system/processes.json".to_string(),
        other => format!("{other}.json"),
    }
}

fn to_pretty(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| "{}".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::io::Read;

    struct StubCollector {
        name: &'static str,
        timeout: Duration,
        delay: Duration,
    }

    impl StubCollector {
        fn quick(name: &'static str) -> Arc<dyn Collector> {
            Arc::new(Self {
                name,
                timeout: Duration::from_secs(10),
                delay: Duration::ZERO,
            })
        }
    }

    #[async_trait]
    impl Collector for StubCollector {
        fn name(&self) -> &'static str {
            self.name
        }

        fn timeout(&self) -> Duration {
            self.timeout
        }

        async fn collect(&self) -> anyhow::Result<Map<String, Value>> {
            tokio::time::sleep(self.delay).await;
            let mut data = Map::new();
            data.insert("from".into(), Value::String(self.name.to_string()));
            if self.name == "logs" {
                data.insert(
                    "entries".into(),
                    json!([{ "level": "info", "message": "one" }, { "level": "warn", "message": "two" }]),
                );
                data.insert("count".into(), Value::from(2));
            }
            Ok(data)
        }
    }

    fn archive_names(bytes: &[u8]) -> HashSet<String> {
        let mut archive = zip::ZipArchive::new(Cursor::new(bytes.to_vec())).unwrap();
        (0..archive.len())
            .map(|i| archive.by_index(i).unwrap().name().to_string())
            .collect()
    }

    fn read_entry(bytes: &[u8], name: &str) -> String {
        let mut archive = zip::ZipArchive::new(Cursor::new(bytes.to_vec())).unwrap();
        let mut file = archive.by_name(name).unwrap();
        let mut content = String::new();
        file.read_to_string(&mut content).unwrap();
        content
    }

    #[tokio::test]
    async fn bundle_layout_is_complete() {
        let service = DiagnosticService::new(vec![
            StubCollector::quick("health"),
            StubCollector::quick("config"),
            StubCollector::quick("logs"),
            StubCollector::quick("custom_probe"),
        ]);
        let bytes = service.generate_bundle().await.unwrap();
        let names = archive_names(&bytes);

        assert!(names.contains("metadata.json"));
        assert!(names.contains("health/health_snapshot.json"));
        assert!(names.contains("config/redacted_config.json"));
        assert!(names.contains("logs/recent.jsonl"));
        assert!(names.contains("logs/summary.json"));
        assert!(names.contains("custom_probe.json"));
        assert!(names.contains("collector_summary.json"));

        let metadata: Value =
            serde_json::from_str(&read_entry(&bytes, "metadata.json")).unwrap();
        let id = metadata["host_id"].as_str().unwrap();
        assert_eq!(id.len(), 12);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert!(metadata.get("hostname").is_none());

        let ndjson = read_entry(&bytes, "logs/recent.jsonl");
        assert_eq!(ndjson.lines().count(), 2);
        let summary: Value =
            serde_json::from_str(&read_entry(&bytes, "logs/summary.json")).unwrap();
        assert_eq!(summary["count"], 2);
        assert!(summary.get("entries").is_none());
    }

    #[tokio::test]
    async fn timed_out_collector_is_reported_in_place() {
        let slow: Arc<dyn Collector> = Arc::new(StubCollector {
            name: "slow",
            timeout: Duration::from_millis(100),
            delay: Duration::from_secs(5),
        });
        let service = DiagnosticService::new(vec![slow, StubCollector::quick("health")]);
        let bytes = service.generate_bundle().await.unwrap();

        let slow_body: Value = serde_json::from_str(&read_entry(&bytes, "slow.json")).unwrap();
        assert!(slow_body["_collector_error"]
            .as_str()
            .unwrap()
            .contains("timed out"));
        assert!(slow_body["_collector_duration_ms"].as_f64().unwrap() >= 100.0);

        let summary: Value =
            serde_json::from_str(&read_entry(&bytes, "collector_summary.json")).unwrap();
        assert!(summary["slow"]["error"]
            .as_str()
            .unwrap()
            .contains("timed out"));
        assert!(summary["health"]["error"].is_null());
    }

    #[tokio::test]
    async fn collectors_run_concurrently() {
        let collectors: Vec<Arc<dyn Collector>> = (0..4)
            .map(|i| {
                Arc::new(StubCollector {
                    name: ["a", "b", "c", "d"][i],
                    timeout: Duration::from_secs(10),
                    delay: Duration::from_millis(200),
                }) as Arc<dyn Collector>
            })
            .collect();
        let service = DiagnosticService::new(collectors);

        let start = std::time::Instant::now();
        service.generate_bundle().await.unwrap();
        // Four 200ms collectors in parallel finish well under 800ms.
        assert!(start.elapsed() < Duration::from_millis(700));
    }
}
