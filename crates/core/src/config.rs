use std::env;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

fn env_u16(key: &str, default: u16) -> u16 {
    env_opt(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    env_opt(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    env_opt(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    env_opt(key)
        .map(|v| matches!(v.as_str(), "1" | "true" | "yes"))
        .unwrap_or(default)
}

// ── Top-level config ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// "standalone" (no metering, no authority) or "connected".
    pub mode: String,
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub logging: LogConfig,
    pub authority: AuthorityConfig,
    pub security: SecurityConfig,
    pub qdrant: QdrantConfig,
    pub postgres: PostgresConfig,
    pub llm: LlmConfig,
    pub features: FeatureConfig,
    pub metering: MeteringConfig,
    pub update: UpdateConfig,
}

impl Config {
    /// Build config from environment variables (call `load_dotenv()` first).
    /// Unrecognized variables are ignored.
    pub fn from_env() -> Self {
        Self {
            mode: env_or("VAIZ_MODE", "standalone"),
            server: ServerConfig::from_env(),
            storage: StorageConfig::from_env(),
            logging: LogConfig::from_env(),
            authority: AuthorityConfig::from_env(),
            security: SecurityConfig::from_env(),
            qdrant: QdrantConfig::from_env(),
            postgres: PostgresConfig::from_env(),
            llm: LlmConfig::from_env(),
            features: FeatureConfig::from_env(),
            metering: MeteringConfig::from_env(),
            update: UpdateConfig::from_env(),
        }
    }

    pub fn is_standalone(&self) -> bool {
        self.mode == "standalone"
    }

    /// Print a redacted summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Config loaded:");
        tracing::info!("  mode:       {}", self.mode);
        tracing::info!("  server:     {}:{}", self.server.host, self.server.port);
        tracing::info!("  storage:    data_dir={}", self.storage.data_dir.display());
        tracing::info!(
            "  logging:    dir={}, level={}",
            self.logging.dir.display(),
            self.logging.level
        );
        tracing::info!("  authority:  url={}", self.authority.base_url);
        tracing::info!("  qdrant:     {}:{}", self.qdrant.host, self.qdrant.port);
        tracing::info!(
            "  postgres:   host={}, db={}",
            self.postgres.host,
            self.postgres.database
        );
        tracing::info!("  llm:        provider={}", self.llm.provider);
    }

    /// Full configuration snapshot for the diagnostic config collector.
    ///
    /// Includes secret-bearing fields; callers must pass the result through
    /// the key-based redactor before it leaves the process.
    pub fn snapshot(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

// ── Server ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub cors_origin: String,
}

impl ServerConfig {
    fn from_env() -> Self {
        Self {
            host: env_or("VAIZ_HOST", "0.0.0.0"),
            port: env_u16("VAIZ_PORT", 8000),
            cors_origin: env_or("VAIZ_CORS_ORIGIN", "*"),
        }
    }
}

// ── Storage ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
}

impl StorageConfig {
    fn from_env() -> Self {
        Self {
            data_dir: PathBuf::from(env_or("VAIZ_DATA_DIR", "data")),
        }
    }

    pub fn serial_state_path(&self) -> PathBuf {
        self.data_dir.join("serial_state.json")
    }

    pub fn offline_queue_path(&self) -> PathBuf {
        self.data_dir.join("offline_meter_queue.jsonl")
    }

    pub fn issues_path(&self) -> PathBuf {
        self.data_dir.join("issues.json")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.data_dir.join("vectoraiz.lock")
    }
}

// ── Logging ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    pub dir: PathBuf,
    pub file: String,
    pub level: String,
    pub max_bytes: u64,
    pub backup_count: u32,
}

impl LogConfig {
    fn from_env() -> Self {
        Self {
            dir: PathBuf::from(env_or("VAIZ_LOG_DIR", "logs")),
            file: env_or("VAIZ_LOG_FILE", "vectoraiz.jsonl"),
            level: env_or("VAIZ_LOG_LEVEL", "info"),
            max_bytes: env_u64("VAIZ_LOG_MAX_BYTES", 10 * 1024 * 1024),
            backup_count: env_u32("VAIZ_LOG_BACKUPS", 5),
        }
    }
}

// ── Serial authority ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorityConfig {
    pub base_url: String,
    pub timeout_secs: u64,
}

impl AuthorityConfig {
    fn from_env() -> Self {
        Self {
            base_url: env_or("VAIZ_AUTHORITY_URL", "https://ai.market"),
            timeout_secs: env_u64("VAIZ_AUTHORITY_TIMEOUT_SECS", 10),
        }
    }
}

// ── Security ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Required in connected mode; guards the deep-health, issues, and
    /// diagnostics surface.
    pub internal_api_key: Option<String>,
    pub keystore_passphrase: Option<String>,
    pub keystore_path: PathBuf,
}

impl SecurityConfig {
    fn from_env() -> Self {
        Self {
            internal_api_key: env_opt("VAIZ_INTERNAL_API_KEY"),
            keystore_passphrase: env_opt("VAIZ_KEYSTORE_PASSPHRASE"),
            keystore_path: PathBuf::from(env_or("VAIZ_KEYSTORE_PATH", "data/keystore.json")),
        }
    }
}

// ── Qdrant ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QdrantConfig {
    pub host: String,
    pub port: u16,
}

impl QdrantConfig {
    fn from_env() -> Self {
        Self {
            host: env_or("QDRANT_HOST", "localhost"),
            port: env_u16("QDRANT_PORT", 6333),
        }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

// ── PostgreSQL ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostgresConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub max_connections: u32,
}

impl PostgresConfig {
    fn from_env() -> Self {
        Self {
            host: env_or("PG_HOST", "localhost"),
            port: env_u16("PG_PORT", 5432),
            database: env_or("PG_DATABASE", "vectoraiz"),
            username: env_opt("PG_USERNAME"),
            password: env_opt("PG_PASSWORD"),
            max_connections: env_u32("PG_MAX_CONNECTIONS", 10),
        }
    }

    pub fn connection_string(&self) -> String {
        let user = self.username.as_deref().unwrap_or("postgres");
        let pass = self.password.as_deref().unwrap_or("");
        format!(
            "postgres://{}:{}@{}:{}/{}",
            user, pass, self.host, self.port, self.database
        )
    }

    pub fn is_configured(&self) -> bool {
        self.username.is_some()
    }
}

// ── LLM provider (config presence only — clients live elsewhere) ──

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub provider: String,
    pub api_key: Option<String>,
}

impl LlmConfig {
    fn from_env() -> Self {
        Self {
            provider: env_or("LLM_PROVIDER", "anthropic"),
            api_key: env_opt("LLM_API_KEY"),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }
}

// ── Feature flags ─────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureConfig {
    pub allai_enabled: bool,
    pub marketplace_enabled: bool,
}

impl FeatureConfig {
    fn from_env() -> Self {
        Self {
            allai_enabled: env_bool("VAIZ_ALLAI_ENABLED", true),
            marketplace_enabled: env_bool("VAIZ_MARKETPLACE_ENABLED", false),
        }
    }
}

// ── Metering tunables ─────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeteringConfig {
    /// Consecutive authority failures after which ACTIVE degrades.
    pub failure_threshold: u32,
    /// Consecutive failures at which offline data metering is refused.
    /// Compared after the current failure has been counted.
    pub offline_data_failure_limit: u32,
    pub activation_retry_secs: u64,
    pub status_poll_secs: u64,
}

impl MeteringConfig {
    fn from_env() -> Self {
        Self {
            failure_threshold: env_u32("VAIZ_FAILURE_THRESHOLD", 5),
            offline_data_failure_limit: env_u32("VAIZ_OFFLINE_DATA_FAILURE_LIMIT", 3),
            activation_retry_secs: env_u64("VAIZ_ACTIVATION_RETRY_SECS", 30),
            status_poll_secs: env_u64("VAIZ_STATUS_POLL_SECS", 300),
        }
    }
}

// ── Software updates ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateConfig {
    /// JSON feed listing published release tags. Absent in air-gapped
    /// deployments, which disables the version check entirely.
    pub feed_url: Option<String>,
    pub check_interval_secs: u64,
}

impl UpdateConfig {
    fn from_env() -> Self {
        Self {
            feed_url: env_opt("VAIZ_UPDATE_FEED_URL"),
            check_interval_secs: env_u64("VAIZ_UPDATE_CHECK_SECS", 6 * 60 * 60),
        }
    }
}
