//! HTTP client for the serial authority.
//!
//! Wraps POST /api/v1/serials/{serial}/{activate,meter,refresh} and the
//! status GET with retry + backoff on transport errors. HTTP statuses are
//! never retried; callers see them through the outcome enums.

use std::time::Duration;

use serde_json::{json, Map, Value};

const RETRY_DELAYS: [Duration; 2] = [Duration::from_secs(1), Duration::from_secs(3)];
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq)]
pub enum ActivateOutcome {
    Activated { install_token: String },
    AuthRevoked,
    Rejected { status: u16, error: String },
    Unreachable { error: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct MeterReceipt {
    pub category: String,
    pub cost_usd: String,
    pub remaining_usd: String,
    pub payment_enabled: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MeterDenial {
    pub status: u16,
    pub reason: Option<String>,
    pub remaining_usd: String,
    pub payment_enabled: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MeterOutcome {
    Allowed(MeterReceipt),
    /// Authoritative denial (HTTP 200 or 402 with `allowed=false`).
    Denied(MeterDenial),
    /// The serial has been migrated to gateway billing.
    Migrated,
    AuthRevoked,
    Rejected { status: u16, error: String },
    Unreachable { error: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum StatusOutcome {
    Ok {
        data: Map<String, Value>,
        migrated: bool,
        gateway_user_id: Option<String>,
    },
    AuthRevoked,
    Rejected { status: u16, error: String },
    Unreachable { error: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum RefreshOutcome {
    Refreshed { install_token: String },
    AuthRevoked,
    Rejected { status: u16, error: String },
    Unreachable { error: String },
}

pub struct SerialClient {
    client: reqwest::Client,
    base_url: String,
}

impl SerialClient {
    pub fn new(base_url: &str, timeout: Option<Duration>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout.unwrap_or(DEFAULT_TIMEOUT))
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// One request with up to two transport-level retries. Returns the HTTP
    /// status (0 after retry exhaustion) and the parsed JSON body, if any.
    async fn request(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<Value>,
        bearer: Option<&str>,
    ) -> (u16, Option<Value>) {
        let url = format!("{}{}", self.base_url, path);
        let mut last_error = String::new();

        for attempt in 0..=RETRY_DELAYS.len() {
            let mut req = self.client.request(method.clone(), &url);
            if let Some(body) = &body {
                req = req.json(body);
            }
            if let Some(token) = bearer {
                req = req.bearer_auth(token);
            }

            match req.send().await {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    let data = resp.json::<Value>().await.ok();
                    return (status, data);
                }
                Err(e) if (e.is_timeout() || e.is_connect()) && attempt < RETRY_DELAYS.len() => {
                    let delay = RETRY_DELAYS[attempt];
                    tracing::warn!(
                        attempt = attempt + 1,
                        path,
                        error = %e,
                        wait_s = delay.as_secs(),
                        "serial authority retry"
                    );
                    tokio::time::sleep(delay).await;
                    last_error = e.to_string();
                }
                Err(e) => {
                    tracing::error!(path, error = %e, "serial authority request failed");
                    return (0, Some(json!({ "transport_error": e.to_string() })));
                }
            }
        }

        tracing::error!(path, error = %last_error, "serial authority retries exhausted");
        (0, Some(json!({ "transport_error": last_error })))
    }

    pub async fn activate(
        &self,
        serial: &str,
        bootstrap_token: &str,
        instance_id: &str,
        hostname: &str,
        version: &str,
    ) -> ActivateOutcome {
        let (status, data) = self
            .request(
                reqwest::Method::POST,
                &format!("/api/v1/serials/{serial}/activate"),
                Some(json!({
                    "bootstrap_token": bootstrap_token,
                    "instance_id": instance_id,
                    "hostname": hostname,
                    "app_version": version,
                })),
                None,
            )
            .await;

        if status == 200 {
            if let Some(token) = data
                .as_ref()
                .and_then(|d| d.get("install_token"))
                .and_then(Value::as_str)
            {
                return ActivateOutcome::Activated {
                    install_token: token.to_string(),
                };
            }
        }
        if status == 401 {
            return ActivateOutcome::AuthRevoked;
        }
        match status {
            0 => ActivateOutcome::Unreachable {
                error: transport_error(&data),
            },
            _ => ActivateOutcome::Rejected {
                status,
                error: body_error(status, &data),
            },
        }
    }

    pub async fn meter(
        &self,
        serial: &str,
        install_token: &str,
        category: &str,
        cost_usd: &str,
        request_id: &str,
        description: &str,
    ) -> MeterOutcome {
        let (status, data) = self
            .request(
                reqwest::Method::POST,
                &format!("/api/v1/serials/{serial}/meter"),
                Some(json!({
                    "install_token": install_token,
                    "category": category,
                    "cost_usd": cost_usd,
                    "request_id": request_id,
                    "description": description,
                })),
                None,
            )
            .await;

        // Both 200 (allowed or denied) and 402 (denied) are valid replies.
        if matches!(status, 200 | 402) {
            if let Some(body) = &data {
                if body.get("migrated").and_then(Value::as_bool).unwrap_or(false) {
                    return MeterOutcome::Migrated;
                }
                let allowed = body.get("allowed").and_then(Value::as_bool).unwrap_or(false);
                let remaining = str_field(body, "remaining_usd", "0.00");
                let payment_enabled = body
                    .get("payment_enabled")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                if allowed {
                    return MeterOutcome::Allowed(MeterReceipt {
                        category: str_field(body, "category", category),
                        cost_usd: str_field(body, "cost_usd", "0.00"),
                        remaining_usd: remaining,
                        payment_enabled,
                    });
                }
                return MeterOutcome::Denied(MeterDenial {
                    status,
                    reason: body.get("reason").and_then(Value::as_str).map(String::from),
                    remaining_usd: remaining,
                    payment_enabled,
                });
            }
        }
        if status == 401 {
            return MeterOutcome::AuthRevoked;
        }
        match status {
            0 => MeterOutcome::Unreachable {
                error: transport_error(&data),
            },
            _ => MeterOutcome::Rejected {
                status,
                error: body_error(status, &data),
            },
        }
    }

    pub async fn status(&self, serial: &str, install_token: &str) -> StatusOutcome {
        let (status, data) = self
            .request(
                reqwest::Method::GET,
                &format!("/api/v1/serials/{serial}/status"),
                None,
                Some(install_token),
            )
            .await;

        if status == 200 {
            if let Some(Value::Object(map)) = data {
                let migrated = map
                    .get("migrated")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                let gateway_user_id = map
                    .get("gateway_user_id")
                    .and_then(Value::as_str)
                    .map(String::from);
                return StatusOutcome::Ok {
                    data: map,
                    migrated,
                    gateway_user_id,
                };
            }
        }
        if status == 401 {
            return StatusOutcome::AuthRevoked;
        }
        match status {
            0 => StatusOutcome::Unreachable {
                error: transport_error(&data),
            },
            _ => StatusOutcome::Rejected {
                status,
                error: body_error(status, &data),
            },
        }
    }

    pub async fn refresh(
        &self,
        serial: &str,
        install_token: &str,
        instance_id: &str,
    ) -> RefreshOutcome {
        let (status, data) = self
            .request(
                reqwest::Method::POST,
                &format!("/api/v1/serials/{serial}/refresh"),
                Some(json!({
                    "install_token": install_token,
                    "instance_id": instance_id,
                })),
                None,
            )
            .await;

        if status == 200 {
            if let Some(token) = data
                .as_ref()
                .and_then(|d| d.get("install_token"))
                .and_then(Value::as_str)
            {
                return RefreshOutcome::Refreshed {
                    install_token: token.to_string(),
                };
            }
        }
        if status == 401 {
            return RefreshOutcome::AuthRevoked;
        }
        match status {
            0 => RefreshOutcome::Unreachable {
                error: transport_error(&data),
            },
            _ => RefreshOutcome::Rejected {
                status,
                error: body_error(status, &data),
            },
        }
    }
}

fn str_field(body: &Value, key: &str, default: &str) -> String {
    body.get(key)
        .and_then(Value::as_str)
        .unwrap_or(default)
        .to_string()
}

fn transport_error(data: &Option<Value>) -> String {
    data.as_ref()
        .and_then(|d| d.get("transport_error"))
        .and_then(Value::as_str)
        .unwrap_or("connection failed")
        .to_string()
}

/// Non-2xx bodies that parse as JSON contribute their `detail`; anything
/// else is synthesized as "HTTP <code>".
fn body_error(status: u16, data: &Option<Value>) -> String {
    match data {
        Some(body) => body
            .get("detail")
            .and_then(Value::as_str)
            .map(String::from)
            .unwrap_or_else(|| body.to_string()),
        None => format!("HTTP {status}"),
    }
}
