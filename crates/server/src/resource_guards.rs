//! Resource exhaustion guards.
//!
//! Disk and memory are checked once at startup and then every interval.
//! A critically full disk raises the process-wide ingestion block; memory
//! pressure only records issues. The loop must never die, whatever a
//! single iteration does.

use std::path::{Path, PathBuf};
use std::time::Duration;

use vaiz_core::issue_tracker::issue_tracker;
use vaiz_diagnostics::system::{disk_free_pct, memory_available_pct};

use crate::probes::{DISK_CRITICAL_PCT, DISK_WARN_PCT, MEMORY_CRITICAL_PCT, MEMORY_WARN_PCT};
use crate::state::set_ingestion_blocked;

pub const CHECK_INTERVAL: Duration = Duration::from_secs(60);

pub fn check_disk(data_dir: &Path) -> serde_json::Value {
    let Some(free_pct) = disk_free_pct(data_dir) else {
        tracing::error!("disk check failed");
        return serde_json::json!({ "status": "unknown" });
    };

    if free_pct < DISK_CRITICAL_PCT {
        set_ingestion_blocked(true);
        issue_tracker().record("VAI-SYS-001", Some("disk"));
        tracing::error!(
            disk.free_pct = free_pct,
            ingestion_blocked = true,
            "disk space critical"
        );
        serde_json::json!({ "status": "down", "free_pct": free_pct })
    } else if free_pct < DISK_WARN_PCT {
        set_ingestion_blocked(false);
        issue_tracker().record("VAI-SYS-001", Some("disk"));
        tracing::warn!(disk.free_pct = free_pct, "disk space low");
        serde_json::json!({ "status": "degraded", "free_pct": free_pct })
    } else {
        set_ingestion_blocked(false);
        serde_json::json!({ "status": "ok", "free_pct": free_pct })
    }
}

pub fn check_memory() -> serde_json::Value {
    let avail_pct = memory_available_pct();

    if avail_pct < MEMORY_CRITICAL_PCT {
        issue_tracker().record("VAI-SYS-002", Some("memory"));
        tracing::error!(mem.avail_pct = avail_pct, "memory critical");
        serde_json::json!({ "status": "down", "avail_pct": avail_pct })
    } else if avail_pct < MEMORY_WARN_PCT {
        issue_tracker().record("VAI-SYS-002", Some("memory"));
        tracing::warn!(mem.avail_pct = avail_pct, "memory pressure");
        serde_json::json!({ "status": "degraded", "avail_pct": avail_pct })
    } else {
        serde_json::json!({ "status": "ok", "avail_pct": avail_pct })
    }
}

async fn run_checks(data_dir: PathBuf) {
    let result = tokio::task::spawn_blocking(move || {
        check_disk(&data_dir);
        check_memory();
    })
    .await;
    if let Err(e) = result {
        tracing::error!(error = %e, "resource check task failed");
    }
}

/// Periodic resource monitor, spawned from startup wiring.
pub async fn resource_monitor_loop(data_dir: PathBuf, interval: Duration) {
    run_checks(data_dir.clone()).await;

    loop {
        tokio::time::sleep(interval).await;
        run_checks(data_dir.clone()).await;
    }
}
