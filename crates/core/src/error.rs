//! Structured application errors tied to the error registry.
//!
//! Raise a [`VaizError`] with a registry code and the HTTP layer will
//! produce a sanitized structured response. The `detail` field is for
//! logs only and never reaches a client.

use serde_json::{Map, Value};
use thiserror::Error;

/// Validate an error code against `^[A-Z]+-[A-Z]{2,6}-\d{3}$`.
pub fn is_valid_code(code: &str) -> bool {
    let mut parts = code.split('-');
    let (Some(prefix), Some(domain), Some(num), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return false;
    };
    !prefix.is_empty()
        && prefix.chars().all(|c| c.is_ascii_uppercase())
        && (2..=6).contains(&domain.len())
        && domain.chars().all(|c| c.is_ascii_uppercase())
        && num.len() == 3
        && num.chars().all(|c| c.is_ascii_digit())
}

/// Extract the domain segment of a code ("VAI-QDR-001" → "QDR").
pub fn code_domain(code: &str) -> Option<&str> {
    code.split('-').nth(1)
}

#[derive(Debug, Error)]
#[error("invalid error code format: {0:?}")]
pub struct InvalidCode(pub String);

/// Structured application error.
///
/// `detail` is internal-only; `context` is attached to the log record as
/// `error.ctx.<key>` fields.
#[derive(Debug, Error)]
#[error("{code}{}", .detail.as_ref().map(|d| format!(": {d}")).unwrap_or_default())]
pub struct VaizError {
    pub code: String,
    pub detail: Option<String>,
    pub context: Map<String, Value>,
}

impl VaizError {
    /// Construct with a registry code. Fails when the code does not match
    /// the required pattern.
    pub fn new(code: &str) -> Result<Self, InvalidCode> {
        if !is_valid_code(code) {
            return Err(InvalidCode(code.to_string()));
        }
        Ok(Self {
            code: code.to_string(),
            detail: None,
            context: Map::new(),
        })
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}
