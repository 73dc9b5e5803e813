//! Device keystore for the trust channel.
//!
//! A single JSON file holding the device identity secret, sealed with
//! AES-256-GCM under a PBKDF2-derived key. Writes are atomic so a crash
//! never corrupts an existing keystore.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

const PBKDF2_ITERATIONS: u32 = 600_000;
const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

#[derive(Debug, Error)]
pub enum KeystoreError {
    #[error("keystore IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("keystore file is not valid JSON: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("keystore record is not valid hex: {0}")]
    Encoding(#[from] hex::FromHexError),

    #[error("malformed sealed record")]
    Format,

    /// Wrong passphrase or a tampered file; GCM refuses to open either.
    #[error("keystore integrity check failed")]
    Integrity,
}

#[derive(Serialize, Deserialize)]
struct KeystoreFile {
    salt: String,
    /// Sealed device identity secret, `{nonce}.{ciphertext}` in hex. The
    /// GCM auth tag rides at the end of the ciphertext.
    device_secret: String,
    device_id: String,
    created_at: String,
}

#[derive(Debug, Clone)]
pub struct DeviceKeys {
    /// Public device identity: a digest of the secret, safe to share.
    pub device_id: String,
}

pub struct DeviceKeystore {
    path: PathBuf,
    passphrase: String,
    io_lock: Mutex<()>,
}

impl DeviceKeystore {
    pub fn new(path: impl Into<PathBuf>, passphrase: &str) -> Self {
        Self {
            path: path.into(),
            passphrase: passphrase.to_string(),
            io_lock: Mutex::new(()),
        }
    }

    /// Load the device keys, generating and persisting a fresh identity on
    /// first use.
    pub fn get_or_create_keys(&self) -> Result<DeviceKeys, KeystoreError> {
        let _guard = self.io_lock.lock().unwrap();

        if self.path.exists() {
            let data = std::fs::read_to_string(&self.path)?;
            let file: KeystoreFile = serde_json::from_str(&data)?;
            let salt = hex::decode(&file.salt)?;
            let key = self.derive_key(&salt);
            let secret = open_secret(&key, &file.device_secret)?;
            return Ok(DeviceKeys {
                device_id: device_id(&secret),
            });
        }

        let mut salt = [0u8; 16];
        OsRng.fill_bytes(&mut salt);
        let mut secret = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut secret);

        let key = self.derive_key(&salt);
        let file = KeystoreFile {
            salt: hex::encode(salt),
            device_secret: seal_secret(&key, &secret)?,
            device_id: device_id(&secret),
            created_at: chrono::Utc::now().to_rfc3339(),
        };
        self.write_atomic(&file)?;
        tracing::info!(path = %self.path.display(), "device keystore created");
        Ok(DeviceKeys {
            device_id: file.device_id,
        })
    }

    pub fn keys_present(&self) -> bool {
        self.get_or_create_keys().is_ok()
    }

    /// PBKDF2-HMAC-SHA256 passphrase stretch, 256-bit output.
    fn derive_key(&self, salt: &[u8]) -> [u8; KEY_LEN] {
        let mut derived = [0u8; KEY_LEN];
        pbkdf2_hmac::<Sha256>(
            self.passphrase.as_bytes(),
            salt,
            PBKDF2_ITERATIONS,
            &mut derived,
        );
        derived
    }

    fn write_atomic(&self, file: &KeystoreFile) -> Result<(), KeystoreError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(file)?)?;
        set_owner_only(&tmp)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

fn device_id(secret: &[u8]) -> String {
    hex::encode(Sha256::digest(secret))[..16].to_string()
}

/// Seal a secret under the derived key. The record is `{nonce}.{ciphertext}`
/// in hex; GCM appends its auth tag to the ciphertext, so integrity travels
/// with the record.
fn seal_secret(key: &[u8; KEY_LEN], plaintext: &[u8]) -> Result<String, KeystoreError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));

    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);

    let sealed = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| KeystoreError::Integrity)?;

    Ok(format!("{}.{}", hex::encode(nonce), hex::encode(sealed)))
}

/// Open a sealed `{nonce}.{ciphertext}` record.
fn open_secret(key: &[u8; KEY_LEN], record: &str) -> Result<Vec<u8>, KeystoreError> {
    let (nonce_hex, sealed_hex) = record.split_once('.').ok_or(KeystoreError::Format)?;

    let nonce = hex::decode(nonce_hex)?;
    if nonce.len() != NONCE_LEN {
        return Err(KeystoreError::Format);
    }
    let sealed = hex::decode(sealed_hex)?;

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    cipher
        .decrypt(Nonce::from_slice(&nonce), sealed.as_ref())
        .map_err(|_| KeystoreError::Integrity)
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

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn seal_open_roundtrip() {
        let mut key = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut key);

        let secret = b"device identity secret bytes";
        let record = seal_secret(&key, secret).unwrap();
        assert_eq!(open_secret(&key, &record).unwrap(), secret);

        let (nonce_hex, sealed_hex) = record.split_once('.').unwrap();
        assert_eq!(nonce_hex.len(), NONCE_LEN * 2);
        // Ciphertext carries the 16-byte GCM tag.
        assert_eq!(sealed_hex.len(), (secret.len() + 16) * 2);
    }

    #[test]
    fn open_rejects_garbage_records() {
        let key = [7u8; KEY_LEN];
        assert!(matches!(
            open_secret(&key, "no-dot-here"),
            Err(KeystoreError::Format)
        ));
        assert!(matches!(
            open_secret(&key, "abcd.zzzz"),
            Err(KeystoreError::Encoding(_))
        ));
        // Valid hex, wrong nonce length.
        assert!(matches!(
            open_secret(&key, "abcd.abcdef"),
            Err(KeystoreError::Format)
        ));
    }

    #[test]
    fn keystore_is_stable_across_reopens() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("keystore.json");

        let store = DeviceKeystore::new(&path, "hunter2 passphrase");
        let first = store.get_or_create_keys().unwrap();
        assert_eq!(first.device_id.len(), 16);

        let reopened = DeviceKeystore::new(&path, "hunter2 passphrase");
        let second = reopened.get_or_create_keys().unwrap();
        assert_eq!(first.device_id, second.device_id);
        assert!(reopened.keys_present());
    }

    #[test]
    fn wrong_passphrase_yields_no_keys() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("keystore.json");

        DeviceKeystore::new(&path, "correct")
            .get_or_create_keys()
            .unwrap();
        let wrong = DeviceKeystore::new(&path, "incorrect");
        assert!(matches!(
            wrong.get_or_create_keys(),
            Err(KeystoreError::Integrity)
        ));
        assert!(!wrong.keys_present());
    }
}
