//! Host introspection: hashed host identity, label sanitization, and the
//! system collector (OS, CPU, memory, disk, uptime).
//!
//! The raw hostname never leaves the process; diagnostics carry only a
//! truncated SHA-256 digest of it.

use std::path::Path;

use async_trait::async_trait;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use sysinfo::{Disks, System};

use crate::collector::Collector;

/// Raw hostname, for payloads addressed to the authority. Diagnostics
/// output must use [`host_id`] instead.
pub fn hostname() -> String {
    System::host_name().unwrap_or_else(|| "unknown".to_string())
}

/// Truncated SHA-256 of the hostname.
pub fn host_id() -> String {
    let digest = Sha256::digest(hostname().as_bytes());
    hex::encode(digest)[..12].to_string()
}

/// Strip control characters and cap length for safe diagnostic output.
pub fn sanitize_label(label: &str) -> String {
    label
        .chars()
        .filter(|&c| !c.is_control() && !('\u{7f}'..='\u{9f}').contains(&c))
        .take(255)
        .collect()
}

/// `(total, available)` bytes for the filesystem holding `path`, picked by
/// longest matching mount point.
pub fn disk_space(path: &Path) -> Option<(u64, u64)> {
    let disks = Disks::new_with_refreshed_list();
    disks
        .iter()
        .filter(|d| path.starts_with(d.mount_point()) || d.mount_point() == Path::new("/"))
        .max_by_key(|d| d.mount_point().as_os_str().len())
        .map(|d| (d.total_space(), d.available_space()))
}

/// `(total, available)` bytes of system memory.
pub fn memory_space() -> (u64, u64) {
    let mut sys = System::new();
    sys.refresh_memory();
    (sys.total_memory(), sys.available_memory())
}

fn percent_free(total: u64, available: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    round1(available as f64 / total as f64 * 100.0)
}

/// Free-disk percentage for the filesystem holding `path`.
pub fn disk_free_pct(path: &Path) -> Option<f64> {
    disk_space(path).map(|(total, available)| percent_free(total, available))
}

/// Available-memory percentage.
pub fn memory_available_pct() -> f64 {
    let (total, available) = memory_space();
    percent_free(total, available)
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

// ── System collector ──────────────────────────────────────────────

pub struct SystemCollector;

#[async_trait]
impl Collector for SystemCollector {
    fn name(&self) -> &'static str {
        "system"
    }

    async fn collect(&self) -> anyhow::Result<Map<String, Value>> {
        // sysinfo refreshes are blocking; keep them off the event loop.
        let data = tokio::task::spawn_blocking(gather).await?;
        Ok(data)
    }
}

fn gather() -> Map<String, Value> {
    let mut sys = System::new();
    sys.refresh_memory();
    sys.refresh_cpu();

    let (disk_total, disk_avail) = disk_space(Path::new("/")).unwrap_or((0, 0));
    let cpu_freq_mhz = sys.cpus().first().map(|c| c.frequency());

    let mut data = Map::new();
    data.insert(
        "platform".into(),
        Value::String(format!(
            "{} {}",
            System::name().unwrap_or_else(|| "unknown".into()),
            System::os_version().unwrap_or_default()
        )),
    );
    data.insert(
        "architecture".into(),
        Value::String(System::cpu_arch().unwrap_or_else(|| "unknown".into())),
    );
    data.insert("host_id".into(), Value::String(host_id()));
    data.insert("cpu_count".into(), Value::from(sys.cpus().len()));
    data.insert(
        "cpu_freq_mhz".into(),
        cpu_freq_mhz.map(Value::from).unwrap_or(Value::Null),
    );
    data.insert(
        "memory_total_mb".into(),
        Value::from(round1(sys.total_memory() as f64 / (1024.0 * 1024.0))),
    );
    data.insert(
        "memory_available_mb".into(),
        Value::from(round1(sys.available_memory() as f64 / (1024.0 * 1024.0))),
    );
    data.insert(
        "memory_percent".into(),
        Value::from(round1(100.0 - memory_available_pct())),
    );
    data.insert(
        "disk_total_gb".into(),
        Value::from(round1(disk_total as f64 / (1024.0 * 1024.0 * 1024.0))),
    );
    data.insert(
        "disk_free_gb".into(),
        Value::from(round1(disk_avail as f64 / (1024.0 * 1024.0 * 1024.0))),
    );
    data.insert("uptime_s".into(), Value::from(round1(vaiz_core::uptime_s())));
    data.insert(
        "vectoraiz_version".into(),
        Value::String(vaiz_core::APP_VERSION.into()),
    );
    data
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_id_is_a_short_hex_digest() {
        let id = host_id();
        assert_eq!(id.len(), 12);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        // Deterministic within a process.
        assert_eq!(id, host_id());
        // Never the raw hostname.
        if let Some(name) = System::host_name() {
            assert_ne!(id, name);
        }
    }

    #[test]
    fn labels_are_sanitized() {
        assert_eq!(sanitize_label("prod\x00token\x1f"), "prodtoken");
        assert_eq!(sanitize_label("ok label"), "ok label");
        let long = "x".repeat(300);
        assert_eq!(sanitize_label(&long).len(), 255);
    }

    #[tokio::test]
    async fn system_collector_reports_core_fields() {
        let data = SystemCollector.collect().await.unwrap();
        assert!(data.contains_key("platform"));
        assert!(data["cpu_count"].as_u64().unwrap() > 0);
        assert!(data["memory_total_mb"].as_f64().unwrap() > 0.0);
        assert_eq!(data["host_id"].as_str().unwrap().len(), 12);
        assert_eq!(data["vectoraiz_version"], vaiz_core::APP_VERSION);
    }
}
