//! Persisted serial activation state machine.
//!
//! One state document per process, stored as a single JSON file with mode
//! 0600. Saves are atomic (sibling temp file + rename) so a crash mid-write
//! never replaces a good snapshot with a partial one.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Consecutive authority failures after which ACTIVE degrades.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SerialPhase {
    Unprovisioned,
    Provisioned,
    Active,
    Degraded,
    Migrated,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialState {
    pub state: SerialPhase,
    #[serde(default)]
    pub serial: String,
    #[serde(default)]
    pub bootstrap_token: Option<String>,
    #[serde(default)]
    pub install_token: Option<String>,
    #[serde(default)]
    pub last_app_version: Option<String>,
    #[serde(default)]
    pub last_status_cache: Map<String, Value>,
    #[serde(default)]
    pub last_status_at: Option<String>,
    #[serde(default)]
    pub consecutive_failures: u32,
}

impl Default for SerialState {
    fn default() -> Self {
        Self {
            state: SerialPhase::Unprovisioned,
            serial: String::new(),
            bootstrap_token: None,
            install_token: None,
            last_app_version: None,
            last_status_cache: Map::new(),
            last_status_at: None,
            consecutive_failures: 0,
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("serial state IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serial state serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

// ── Persistence ───────────────────────────────────────────────────

/// Where the state document lives. The in-memory implementation backs
/// tests; the disk implementation owns the atomic-rename contract.
pub trait StatePersistence: Send + Sync {
    /// `Ok(None)` when no usable document exists yet.
    fn load(&self) -> Result<Option<SerialState>, StoreError>;
    fn save(&self, state: &SerialState) -> Result<(), StoreError>;
}

pub struct DiskPersistence {
    path: PathBuf,
}

impl DiskPersistence {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl StatePersistence for DiskPersistence {
    fn load(&self) -> Result<Option<SerialState>, StoreError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let data = std::fs::read_to_string(&self.path)?;
        // An unreadable or unknown-phase document yields a fresh state;
        // the existing file is left alone until the first save.
        match serde_json::from_str::<SerialState>(&data) {
            Ok(state) => Ok(Some(state)),
            Err(e) => {
                tracing::warn!(error = %e, path = %self.path.display(),
                    "serial state unreadable, starting unprovisioned");
                Ok(None)
            }
        }
    }

    fn save(&self, state: &SerialState) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        let data = serde_json::to_string_pretty(state)?;
        std::fs::write(&tmp, data)?;
        set_owner_only(&tmp)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[cfg(unix)]
fn set_owner_only(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn set_owner_only(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

#[derive(Default)]
pub struct MemoryPersistence {
    slot: Mutex<Option<SerialState>>,
}

impl MemoryPersistence {
    pub fn new(initial: Option<SerialState>) -> Self {
        Self {
            slot: Mutex::new(initial),
        }
    }
}

impl StatePersistence for MemoryPersistence {
    fn load(&self) -> Result<Option<SerialState>, StoreError> {
        Ok(self.slot.lock().unwrap().clone())
    }

    fn save(&self, state: &SerialState) -> Result<(), StoreError> {
        *self.slot.lock().unwrap() = Some(state.clone());
        Ok(())
    }
}

// ── Store ─────────────────────────────────────────────────────────

/// In-process owner of the serial state. Mutators are serialized behind one
/// lock and each successful mutation is saved through the persistence layer.
pub struct SerialStore {
    state: Mutex<SerialState>,
    persistence: Box<dyn StatePersistence>,
    failure_threshold: u32,
}

impl SerialStore {
    pub fn new(persistence: Box<dyn StatePersistence>, failure_threshold: u32) -> Self {
        let state = persistence
            .load()
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "serial state load failed, starting unprovisioned");
                None
            })
            .unwrap_or_default();
        Self {
            state: Mutex::new(state),
            persistence,
            failure_threshold,
        }
    }

    pub fn on_disk(path: impl Into<PathBuf>, failure_threshold: u32) -> Self {
        Self::new(Box::new(DiskPersistence::new(path)), failure_threshold)
    }

    pub fn in_memory(initial: SerialState) -> Self {
        let store = Self::new(
            Box::new(MemoryPersistence::default()),
            DEFAULT_FAILURE_THRESHOLD,
        );
        *store.state.lock().unwrap() = initial;
        store
    }

    /// A point-in-time copy. Callers must not expect it to track mutation.
    pub fn snapshot(&self) -> SerialState {
        self.state.lock().unwrap().clone()
    }

    pub fn phase(&self) -> SerialPhase {
        self.state.lock().unwrap().state
    }

    fn mutate<F: FnOnce(&mut SerialState)>(&self, f: F) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        f(&mut state);
        self.persistence.save(&state)
    }

    /// External provisioning step: store the serial and one-shot bootstrap
    /// token, ready for activation.
    pub fn provision(&self, serial: &str, bootstrap_token: &str) -> Result<(), StoreError> {
        self.mutate(|s| {
            s.state = SerialPhase::Provisioned;
            s.serial = serial.to_string();
            s.bootstrap_token = Some(bootstrap_token.to_string());
            s.install_token = None;
            s.consecutive_failures = 0;
        })
    }

    pub fn transition_to_active(&self, install_token: &str) -> Result<(), StoreError> {
        self.mutate(|s| {
            s.state = SerialPhase::Active;
            s.install_token = Some(install_token.to_string());
            s.bootstrap_token = None;
            s.consecutive_failures = 0;
        })
    }

    pub fn transition_to_unprovisioned(&self) -> Result<(), StoreError> {
        self.mutate(|s| {
            s.state = SerialPhase::Unprovisioned;
            s.bootstrap_token = None;
            s.install_token = None;
            s.consecutive_failures = 0;
        })
    }

    pub fn transition_to_migrated(
        &self,
        gateway_user_id: Option<&str>,
    ) -> Result<(), StoreError> {
        self.mutate(|s| {
            s.state = SerialPhase::Migrated;
            if let Some(id) = gateway_user_id {
                s.last_status_cache
                    .insert("gateway_user_id".into(), Value::String(id.to_string()));
            }
        })
    }

    /// Refresh handed back a new install token; state is unchanged.
    pub fn replace_install_token(&self, install_token: &str) -> Result<(), StoreError> {
        self.mutate(|s| {
            s.install_token = Some(install_token.to_string());
        })
    }

    /// Refresh was rejected with 401: drop back to PROVISIONED so the next
    /// activation attempt can run.
    pub fn fall_back_to_provisioned(&self) -> Result<(), StoreError> {
        self.mutate(|s| {
            s.state = SerialPhase::Provisioned;
            s.install_token = None;
        })
    }

    /// A successful (authoritative) interaction resets the failure counter
    /// and lifts DEGRADED back to ACTIVE.
    pub fn record_success(&self) -> Result<(), StoreError> {
        self.mutate(|s| {
            s.consecutive_failures = 0;
            if s.state == SerialPhase::Degraded {
                s.state = SerialPhase::Active;
            }
        })
    }

    /// Count an authority failure; ACTIVE degrades at the threshold.
    /// Returns the new counter value.
    pub fn record_failure(&self) -> Result<u32, StoreError> {
        let mut state = self.state.lock().unwrap();
        state.consecutive_failures += 1;
        if state.state == SerialPhase::Active
            && state.consecutive_failures >= self.failure_threshold
        {
            state.state = SerialPhase::Degraded;
            tracing::warn!(
                failures = state.consecutive_failures,
                "serial state degraded after consecutive authority failures"
            );
        }
        let count = state.consecutive_failures;
        self.persistence.save(&state)?;
        Ok(count)
    }

    pub fn update_status_cache(
        &self,
        payload: Map<String, Value>,
        ts: &str,
    ) -> Result<(), StoreError> {
        self.mutate(|s| {
            s.last_status_cache = payload;
            s.last_status_at = Some(ts.to_string());
        })
    }

    pub fn update_app_version(&self, version: &str) -> Result<(), StoreError> {
        self.mutate(|s| {
            s.last_app_version = Some(version.to_string());
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn disk_store(dir: &Path) -> SerialStore {
        SerialStore::on_disk(dir.join("serial_state.json"), DEFAULT_FAILURE_THRESHOLD)
    }

    #[test]
    fn starts_unprovisioned_without_file() {
        let tmp = tempdir().unwrap();
        let store = disk_store(tmp.path());
        let snap = store.snapshot();
        assert_eq!(snap.state, SerialPhase::Unprovisioned);
        assert!(snap.bootstrap_token.is_none());
        assert!(snap.install_token.is_none());
        // No save yet: the file must not exist.
        assert!(!tmp.path().join("serial_state.json").exists());
    }

    #[test]
    fn activation_roundtrips_through_disk() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("serial_state.json");
        {
            let store = disk_store(tmp.path());
            store.provision("VZ-AAAA1111-BBBB2222", "vzbt_X").unwrap();
            store.transition_to_active("vzit_Y").unwrap();
        }

        let store = disk_store(tmp.path());
        let snap = store.snapshot();
        assert_eq!(snap.state, SerialPhase::Active);
        assert_eq!(snap.serial, "VZ-AAAA1111-BBBB2222");
        assert_eq!(snap.install_token.as_deref(), Some("vzit_Y"));
        assert!(snap.bootstrap_token.is_none());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
        #[cfg(not(unix))]
        let _ = path;
    }

    #[test]
    fn corrupt_file_loads_as_unprovisioned_and_survives_until_save() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("serial_state.json");
        std::fs::write(&path, "{ partial garbage").unwrap();

        let store = disk_store(tmp.path());
        assert_eq!(store.phase(), SerialPhase::Unprovisioned);
        // The broken file is untouched until the first save.
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "{ partial garbage"
        );

        store.provision("VZ-X", "vzbt").unwrap();
        let reloaded = disk_store(tmp.path());
        assert_eq!(reloaded.phase(), SerialPhase::Provisioned);
    }

    #[test]
    fn unknown_phase_value_resets_to_unprovisioned() {
        let tmp = tempdir().unwrap();
        std::fs::write(
            tmp.path().join("serial_state.json"),
            r#"{"state": "quantum", "serial": "VZ-X"}"#,
        )
        .unwrap();
        let store = disk_store(tmp.path());
        assert_eq!(store.phase(), SerialPhase::Unprovisioned);
    }

    #[test]
    fn failure_threshold_degrades_and_success_restores() {
        let store = SerialStore::in_memory(SerialState {
            state: SerialPhase::Active,
            serial: "VZ-X".into(),
            install_token: Some("vzit".into()),
            ..Default::default()
        });

        for n in 1..DEFAULT_FAILURE_THRESHOLD {
            assert_eq!(store.record_failure().unwrap(), n);
            assert_eq!(store.phase(), SerialPhase::Active);
        }
        store.record_failure().unwrap();
        assert_eq!(store.phase(), SerialPhase::Degraded);

        store.record_success().unwrap();
        let snap = store.snapshot();
        assert_eq!(snap.state, SerialPhase::Active);
        assert_eq!(snap.consecutive_failures, 0);
    }

    #[test]
    fn migration_merges_gateway_user_id() {
        let store = SerialStore::in_memory(SerialState {
            state: SerialPhase::Active,
            serial: "VZ-X".into(),
            install_token: Some("vzit".into()),
            ..Default::default()
        });
        store.transition_to_migrated(Some("gw-42")).unwrap();
        let snap = store.snapshot();
        assert_eq!(snap.state, SerialPhase::Migrated);
        assert_eq!(snap.last_status_cache["gateway_user_id"], "gw-42");
    }

    #[test]
    fn unprovision_clears_tokens() {
        let store = SerialStore::in_memory(SerialState {
            state: SerialPhase::Active,
            serial: "VZ-X".into(),
            install_token: Some("vzit".into()),
            ..Default::default()
        });
        store.transition_to_unprovisioned().unwrap();
        let snap = store.snapshot();
        assert_eq!(snap.state, SerialPhase::Unprovisioned);
        assert!(snap.install_token.is_none());
        assert!(snap.bootstrap_token.is_none());
    }
}
