//! Non-critical issue tracker.
//!
//! Bounded LRU of recent issues keyed by error code. Issues that have not
//! recurred within the auto-clear window drop out of the active list.
//! Persists to disk on shutdown and reloads best-effort on startup.

use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

use lru::LruCache;
use serde::{Deserialize, Serialize};

use crate::error::code_domain;

pub const MAX_ISSUES: usize = 100;
pub const AUTO_CLEAR_SECONDS: f64 = 3600.0;

fn now_epoch_s() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackedIssue {
    pub code: String,
    pub component: String,
    pub count: u64,
    pub first_seen: f64,
    pub last_seen: f64,
}

pub struct IssueTracker {
    issues: Mutex<LruCache<String, TrackedIssue>>,
    persist_path: PathBuf,
}

impl IssueTracker {
    pub fn new(persist_path: impl Into<PathBuf>) -> Self {
        Self::with_capacity(persist_path, MAX_ISSUES)
    }

    pub fn with_capacity(persist_path: impl Into<PathBuf>, capacity: usize) -> Self {
        Self {
            issues: Mutex::new(LruCache::new(
                NonZeroUsize::new(capacity.max(1)).unwrap(),
            )),
            persist_path: persist_path.into(),
        }
    }

    /// Record an issue occurrence. The component defaults to the code's
    /// domain segment, lowercased ("VAI-QDR-001" → "qdrant" is the caller's
    /// choice; the default here is "qdr").
    pub fn record(&self, code: &str, component: Option<&str>) {
        let component = component
            .map(str::to_string)
            .unwrap_or_else(|| {
                code_domain(code)
                    .map(|d| d.to_lowercase())
                    .unwrap_or_else(|| "unknown".to_string())
            });

        let now = now_epoch_s();
        let mut issues = self.issues.lock().unwrap();
        if let Some(issue) = issues.get_mut(code) {
            issue.count += 1;
            issue.last_seen = now;
        } else {
            issues.push(
                code.to_string(),
                TrackedIssue {
                    code: code.to_string(),
                    component,
                    count: 1,
                    first_seen: now,
                    last_seen: now,
                },
            );
        }
    }

    /// Issues that have recurred within the auto-clear window.
    pub fn get_active_issues(&self) -> Vec<TrackedIssue> {
        let cutoff = now_epoch_s() - AUTO_CLEAR_SECONDS;
        let issues = self.issues.lock().unwrap();
        let mut active: Vec<TrackedIssue> = issues
            .iter()
            .map(|(_, issue)| issue.clone())
            .filter(|issue| issue.last_seen >= cutoff)
            .collect();
        // LRU iteration is most-recent first; present least-recent first.
        active.reverse();
        active
    }

    /// Save current issues to disk. Best-effort.
    pub fn persist(&self) {
        let data: Vec<TrackedIssue> = {
            let issues = self.issues.lock().unwrap();
            let mut all: Vec<TrackedIssue> =
                issues.iter().map(|(_, issue)| issue.clone()).collect();
            all.reverse();
            all
        };
        let result = (|| -> std::io::Result<()> {
            if let Some(parent) = self.persist_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let json = serde_json::to_string_pretty(&data)?;
            std::fs::write(&self.persist_path, json)
        })();
        match result {
            Ok(()) => tracing::info!(count = data.len(), "issue tracker persisted"),
            Err(e) => tracing::warn!(error = %e, "issue tracker persist failed"),
        }
    }

    /// Reload issues from disk. Corruption or a missing file is logged and
    /// ignored.
    pub fn reload(&self) {
        if !self.persist_path.exists() {
            return;
        }
        let loaded: Vec<TrackedIssue> = match std::fs::read_to_string(&self.persist_path)
            .map_err(|e| e.to_string())
            .and_then(|data| serde_json::from_str(&data).map_err(|e| e.to_string()))
        {
            Ok(list) => list,
            Err(e) => {
                tracing::warn!(error = %e, "issue tracker reload failed");
                return;
            }
        };

        let mut issues = self.issues.lock().unwrap();
        for issue in loaded {
            issues.push(issue.code.clone(), issue);
        }
        tracing::info!(count = issues.len(), "issue tracker reloaded");
    }

    pub fn clear(&self) {
        self.issues.lock().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.issues.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ── Process-global tracker ────────────────────────────────────────

static ISSUE_TRACKER: OnceLock<IssueTracker> = OnceLock::new();

/// Install the tracker with its configured persistence path. Later calls
/// are ignored.
pub fn init_issue_tracker(persist_path: &Path) -> &'static IssueTracker {
    ISSUE_TRACKER.get_or_init(|| IssueTracker::new(persist_path))
}

/// The process-wide tracker. Falls back to the default path when startup
/// wiring has not installed one (tests).
pub fn issue_tracker() -> &'static IssueTracker {
    ISSUE_TRACKER.get_or_init(|| IssueTracker::new("data/issues.json"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn record_increments_and_derives_component() {
        let tracker = IssueTracker::new("unused.json");
        tracker.record("VAI-QDR-001", None);
        tracker.record("VAI-QDR-001", None);
        tracker.record("VAI-SYS-001", Some("disk"));

        let active = tracker.get_active_issues();
        assert_eq!(active.len(), 2);
        let qdr = active.iter().find(|i| i.code == "VAI-QDR-001").unwrap();
        assert_eq!(qdr.count, 2);
        assert_eq!(qdr.component, "qdr");
        let sys = active.iter().find(|i| i.code == "VAI-SYS-001").unwrap();
        assert_eq!(sys.component, "disk");
        assert!(sys.first_seen <= sys.last_seen);
    }

    #[test]
    fn capacity_evicts_least_recent() {
        let tracker = IssueTracker::with_capacity("unused.json", 3);
        tracker.record("VAI-SYS-001", None);
        tracker.record("VAI-SYS-002", None);
        tracker.record("VAI-SYS-003", None);
        // Touch 001 so 002 becomes least-recent.
        tracker.record("VAI-SYS-001", None);
        tracker.record("VAI-SYS-004", None);

        let codes: Vec<String> = tracker
            .get_active_issues()
            .into_iter()
            .map(|i| i.code)
            .collect();
        assert_eq!(tracker.len(), 3);
        assert!(!codes.contains(&"VAI-SYS-002".to_string()));
        assert!(codes.contains(&"VAI-SYS-001".to_string()));
        assert!(codes.contains(&"VAI-SYS-004".to_string()));
    }

    #[test]
    fn stale_issues_are_not_active() {
        let tracker = IssueTracker::new("unused.json");
        tracker.record("VAI-SYS-001", None);
        {
            let mut issues = tracker.issues.lock().unwrap();
            issues.get_mut("VAI-SYS-001").unwrap().last_seen =
                now_epoch_s() - AUTO_CLEAR_SECONDS - 10.0;
        }
        assert!(tracker.get_active_issues().is_empty());
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn persist_reload_roundtrip() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("issues.json");

        let tracker = IssueTracker::new(&path);
        tracker.record("VAI-QDR-001", None);
        tracker.record("VAI-SYS-001", Some("disk"));
        tracker.record("VAI-QDR-001", None);
        tracker.persist();

        let restored = IssueTracker::new(&path);
        restored.reload();
        assert_eq!(restored.len(), 2);
        let active = restored.get_active_issues();
        let qdr = active.iter().find(|i| i.code == "VAI-QDR-001").unwrap();
        assert_eq!(qdr.count, 2);
    }

    #[test]
    fn reload_ignores_corruption() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("issues.json");
        std::fs::write(&path, "not json").unwrap();

        let tracker = IssueTracker::new(&path);
        tracker.reload();
        assert!(tracker.is_empty());
    }
}
