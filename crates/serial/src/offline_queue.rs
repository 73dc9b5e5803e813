//! Append-only queue of meter events recorded while the authority is
//! unreachable. One JSON object per line; replay is at-least-once and the
//! authority deduplicates on `request_id`.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingMeterEvent {
    pub category: String,
    pub cost_usd: String,
    pub request_id: String,
    pub description: String,
    pub timestamp: f64,
}

impl PendingMeterEvent {
    pub fn new(category: &str, cost_usd: &str, request_id: &str, description: &str) -> Self {
        Self {
            category: category.to_string(),
            cost_usd: cost_usd.to_string(),
            request_id: request_id.to_string(),
            description: description.to_string(),
            timestamp: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs_f64())
                .unwrap_or(0.0),
        }
    }
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("offline queue IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("offline queue serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub struct OfflineQueue {
    path: PathBuf,
    lock: Mutex<()>,
}

impl OfflineQueue {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn append(&self, event: &PendingMeterEvent) -> Result<(), QueueError> {
        let _guard = self.lock.lock().unwrap();
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let line = serde_json::to_string(event)?;
        writeln!(file, "{line}")?;
        Ok(())
    }

    pub fn count(&self) -> usize {
        let _guard = self.lock.lock().unwrap();
        self.read_unlocked().len()
    }

    /// All pending events in insertion order.
    pub fn pending(&self) -> Vec<PendingMeterEvent> {
        let _guard = self.lock.lock().unwrap();
        self.read_unlocked()
    }

    /// Remove and return all pending events.
    pub fn drain(&self) -> Result<Vec<PendingMeterEvent>, QueueError> {
        let _guard = self.lock.lock().unwrap();
        let events = self.read_unlocked();
        if self.path.exists() {
            std::fs::write(&self.path, b"")?;
        }
        Ok(events)
    }

    /// Re-append events whose replay failed so a later pass retries them.
    pub fn requeue(&self, events: &[PendingMeterEvent]) -> Result<(), QueueError> {
        for event in events {
            self.append(event)?;
        }
        Ok(())
    }

    fn read_unlocked(&self) -> Vec<PendingMeterEvent> {
        let Ok(data) = std::fs::read_to_string(&self.path) else {
            return Vec::new();
        };
        let mut events = Vec::new();
        let lines: Vec<&str> = data.lines().collect();
        for (i, line) in lines.iter().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<PendingMeterEvent>(line) {
                Ok(event) => events.push(event),
                Err(e) => {
                    // A truncated final record is expected after a crash and
                    // is silently discarded; anything else is worth a warning.
                    if i + 1 != lines.len() {
                        tracing::warn!(line = i + 1, error = %e, "skipping bad offline queue record");
                    }
                }
            }
        }
        events
    }
}
