//! Error registry — loads and validates the error catalog at startup.
//!
//! The process refuses to start with a broken registry: every entry must
//! have a well-formed unique code whose middle segment matches its domain.

use std::collections::HashMap;
use std::path::Path;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::{code_domain, is_valid_code};

/// Default catalog compiled into the binary. `VAIZ_ERROR_REGISTRY` may point
/// at an alternative document on disk.
const DEFAULT_REGISTRY: &str = include_str!("registry.yaml");

const VALID_DOMAINS: &[&str] = &[
    "API", "CFG", "DB", "QDR", "LLM", "ING", "EMB", "RAG", "COP", "SEC", "SYS", "UX", "SER", "DIA",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    #[serde(rename = "DEBUG")]
    Debug,
    #[serde(rename = "INFO")]
    Info,
    #[serde(rename = "WARN")]
    Warn,
    #[serde(rename = "ERROR")]
    Error,
    #[serde(rename = "CRITICAL")]
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
            Self::Critical => "CRITICAL",
        }
    }
}

/// Immutable catalog entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEntry {
    pub code: String,
    pub domain: String,
    pub title: String,
    pub severity: Severity,
    pub retryable: bool,
    pub user_action_required: bool,
    pub http_status: u16,
    pub safe_message: String,
    #[serde(default)]
    pub remediation: Vec<String>,
    #[serde(default)]
    pub detail_template: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub deprecated: bool,
    #[serde(default)]
    pub replaced_by: Option<String>,
    #[serde(default)]
    pub docs_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RegistryDocument {
    #[serde(default)]
    schema_version: u32,
    #[serde(default)]
    errors: Vec<ErrorEntry>,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("failed to read registry document: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse registry document: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid code format: {0:?}")]
    InvalidCode(String),

    #[error("{code}: domain {domain:?} doesn't match code segment {segment:?}")]
    DomainMismatch {
        code: String,
        domain: String,
        segment: String,
    },

    #[error("{code}: unknown domain {domain:?}")]
    UnknownDomain { code: String, domain: String },

    #[error("{code}: http_status {status} out of range")]
    BadHttpStatus { code: String, status: u16 },

    #[error("duplicate code: {0}")]
    DuplicateCode(String),

    #[error("unknown error code: {0:?}")]
    UnknownCode(String),
}

/// Loads, validates, and provides lookup for error codes.
#[derive(Debug, Default)]
pub struct ErrorRegistry {
    entries: HashMap<String, ErrorEntry>,
    schema_version: u32,
}

impl ErrorRegistry {
    /// Load the compiled-in default catalog.
    pub fn load_default() -> Result<Self, RegistryError> {
        Self::load_str(DEFAULT_REGISTRY)
    }

    pub fn load_path(path: &Path) -> Result<Self, RegistryError> {
        let data = std::fs::read_to_string(path)?;
        Self::load_str(&data)
    }

    /// Parse and validate a registry document. Replaces any earlier entries.
    pub fn load_str(data: &str) -> Result<Self, RegistryError> {
        let doc: RegistryDocument = serde_yaml::from_str(data)?;

        let mut entries = HashMap::with_capacity(doc.errors.len());
        for entry in doc.errors {
            if !is_valid_code(&entry.code) {
                return Err(RegistryError::InvalidCode(entry.code));
            }
            let segment = code_domain(&entry.code).unwrap_or_default();
            if entry.domain != segment {
                return Err(RegistryError::DomainMismatch {
                    code: entry.code.clone(),
                    domain: entry.domain.clone(),
                    segment: segment.to_string(),
                });
            }
            if !VALID_DOMAINS.contains(&entry.domain.as_str()) {
                return Err(RegistryError::UnknownDomain {
                    code: entry.code.clone(),
                    domain: entry.domain.clone(),
                });
            }
            if !(100..=599).contains(&entry.http_status) {
                return Err(RegistryError::BadHttpStatus {
                    code: entry.code.clone(),
                    status: entry.http_status,
                });
            }
            if entries.contains_key(&entry.code) {
                return Err(RegistryError::DuplicateCode(entry.code));
            }
            entries.insert(entry.code.clone(), entry);
        }

        tracing::info!(
            count = entries.len(),
            schema_version = doc.schema_version,
            "error registry loaded"
        );
        Ok(Self {
            entries,
            schema_version: doc.schema_version,
        })
    }

    pub fn get(&self, code: &str) -> Option<&ErrorEntry> {
        self.entries.get(code)
    }

    /// Lookup by code, erroring on unknown codes.
    pub fn lookup(&self, code: &str) -> Result<&ErrorEntry, RegistryError> {
        self.entries
            .get(code)
            .ok_or_else(|| RegistryError::UnknownCode(code.to_string()))
    }

    pub fn all_codes(&self) -> Vec<&str> {
        let mut codes: Vec<&str> = self.entries.keys().map(|s| s.as_str()).collect();
        codes.sort_unstable();
        codes
    }

    pub fn codes_for_domain(&self, domain: &str) -> Vec<&str> {
        let mut codes: Vec<&str> = self
            .entries
            .values()
            .filter(|e| e.domain == domain)
            .map(|e| e.code.as_str())
            .collect();
        codes.sort_unstable();
        codes
    }

    pub fn schema_version(&self) -> u32 {
        self.schema_version
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ── Process-global registry ───────────────────────────────────────

static REGISTRY: OnceLock<ErrorRegistry> = OnceLock::new();

/// Install the registry loaded at startup. Returns false if one was already
/// installed (later loads are ignored).
pub fn init_error_registry(registry: ErrorRegistry) -> bool {
    REGISTRY.set(registry).is_ok()
}

/// The registry installed at startup, if any.
pub fn error_registry() -> Option<&'static ErrorRegistry> {
    REGISTRY.get()
}
