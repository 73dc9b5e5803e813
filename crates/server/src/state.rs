use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;

use vaiz_core::Config;
use vaiz_serial::{OfflineQueue, SerialClient, SerialStore};

use crate::collectors::TokenLister;
use crate::keystore::DeviceKeystore;

pub struct AppState {
    pub config: Config,
    pub serial_store: Arc<SerialStore>,
    pub serial_client: Arc<SerialClient>,
    pub offline_queue: Arc<OfflineQueue>,
    pub keystore: Option<Arc<DeviceKeystore>>,
    pub pg_pool: Option<sqlx::PgPool>,
    /// Shared client for qdrant probes and the update feed.
    pub http: reqwest::Client,
    pub tasks: Arc<TaskRegistry>,
    pub metrics: ConnectivityMetrics,
    /// External token service, when one is wired in. The control plane only
    /// consumes summaries; secrets never pass through here.
    pub token_lister: Option<Arc<dyn TokenLister>>,
    /// Monotonic timestamp of the last diagnostic bundle (1/min limit).
    pub last_bundle_at: Mutex<Option<Instant>>,
    pub version_cache: Mutex<VersionCache>,
}

impl AppState {
    pub fn bundle_retry_after(&self, window: Duration) -> Option<u64> {
        let last = self.last_bundle_at.lock().unwrap();
        match *last {
            Some(at) if at.elapsed() < window => {
                Some((window - at.elapsed()).as_secs().max(1))
            }
            _ => None,
        }
    }

    pub fn mark_bundle_generated(&self) {
        *self.last_bundle_at.lock().unwrap() = Some(Instant::now());
    }
}

// ── Ingestion block flag ──────────────────────────────────────────

static INGESTION_BLOCKED: AtomicBool = AtomicBool::new(false);

/// Advisory flag set by the resource guard; chargeable ingestion endpoints
/// refuse work while it is up. Readers accept a racy read.
pub fn ingestion_blocked() -> bool {
    INGESTION_BLOCKED.load(Ordering::Relaxed)
}

pub fn set_ingestion_blocked(blocked: bool) {
    INGESTION_BLOCKED.store(blocked, Ordering::Relaxed);
}

// ── Lightweight request counters for the connectivity collector ───

#[derive(Default)]
pub struct ConnectivityMetrics {
    pub requests_total: AtomicU64,
    pub responses_5xx: AtomicU64,
}

impl ConnectivityMetrics {
    pub fn snapshot(&self) -> serde_json::Value {
        serde_json::json!({
            "requests_total": self.requests_total.load(Ordering::Relaxed),
            "responses_5xx": self.responses_5xx.load(Ordering::Relaxed),
        })
    }
}

// ── Background task registry ──────────────────────────────────────

struct NamedTask {
    name: String,
    handle: JoinHandle<()>,
    aborted: Arc<AtomicBool>,
}

/// Named background tasks, registered in startup order. Shutdown aborts in
/// reverse order and waits for each with a bounded grace period; the
/// processes collector reports their liveness.
#[derive(Default)]
pub struct TaskRegistry {
    tasks: Mutex<Vec<NamedTask>>,
}

pub struct TaskStatus {
    pub name: String,
    pub done: bool,
    pub cancelled: bool,
}

impl TaskRegistry {
    pub fn spawn<F>(&self, name: &str, fut: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(fut);
        self.tasks.lock().unwrap().push(NamedTask {
            name: name.to_string(),
            handle,
            aborted: Arc::new(AtomicBool::new(false)),
        });
        tracing::info!(task = name, "background task started");
    }

    pub fn statuses(&self) -> Vec<TaskStatus> {
        self.tasks
            .lock()
            .unwrap()
            .iter()
            .map(|t| TaskStatus {
                name: t.name.clone(),
                done: t.handle.is_finished(),
                cancelled: t.aborted.load(Ordering::Relaxed),
            })
            .collect()
    }

    /// Abort every task in reverse registration order, awaiting each with
    /// the given grace period.
    pub async fn shutdown(&self, grace: Duration) {
        let mut tasks = {
            let mut guard = self.tasks.lock().unwrap();
            std::mem::take(&mut *guard)
        };
        while let Some(task) = tasks.pop() {
            task.aborted.store(true, Ordering::Relaxed);
            task.handle.abort();
            match tokio::time::timeout(grace, task.handle).await {
                Ok(_) => tracing::info!(task = %task.name, "background task stopped"),
                Err(_) => {
                    tracing::warn!(task = %task.name, "background task did not stop within grace period")
                }
            }
        }
    }
}

// ── Version check cache ───────────────────────────────────────────

#[derive(Default, Clone)]
pub struct VersionCache {
    pub latest_version: Option<String>,
    pub checked_at: Option<Instant>,
}
