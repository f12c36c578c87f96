//! Configuration management for the palisade middleware service.

use std::{fmt, net::SocketAddr, str::FromStr, time::Duration};

use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use palisade_crypto::ColumnTarget;
use palisade_guard::{AuditMode, FailureMode};
use serde::{Deserialize, Serialize};

const CONFIG_FILE: &str = "palisade.toml";

/// String that never appears in `Debug` output or serialized config.
#[derive(Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct SecretString(String);

impl SecretString {
    /// Wraps a secret value.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Returns the secret for use. Never log the result.
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Returns whether the secret is blank.
    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Debug for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            f.write_str("\"\"")
        } else {
            f.write_str("[REDACTED]")
        }
    }
}

/// Complete service configuration with defaults, file, and environment
/// overrides.
///
/// Configuration is loaded in priority order:
/// 1. Environment variables (highest priority)
/// 2. Configuration file (`palisade.toml`)
/// 3. Built-in defaults (lowest priority)
///
/// Key-encryption keys are not part of the configuration. They are read
/// at use time from `DATA_KEK_CURRENT` and `DATA_KEK_<version>` by the
/// environment key registry.
///
/// # Example
///
/// ```no_run
/// use palisade_api::Config;
///
/// let config = Config::load().expect("Failed to load configuration");
///
/// println!("Server will bind to {}:{}", config.host, config.port);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // Database
    /// PostgreSQL connection URL.
    ///
    /// Environment variable: `DATABASE_URL`
    #[serde(default = "default_database_url", alias = "DATABASE_URL")]
    pub database_url: String,
    /// Maximum number of database connections in the pool.
    ///
    /// Environment variable: `DATABASE_MAX_CONNECTIONS`
    #[serde(default = "default_max_connections", alias = "DATABASE_MAX_CONNECTIONS")]
    pub database_max_connections: u32,
    /// Minimum number of connections to maintain in the pool.
    ///
    /// Environment variable: `DATABASE_MIN_CONNECTIONS`
    #[serde(default = "default_min_connections", alias = "DATABASE_MIN_CONNECTIONS")]
    pub database_min_connections: u32,
    /// Database connection acquire timeout in seconds.
    ///
    /// Environment variable: `DATABASE_CONNECTION_TIMEOUT`
    #[serde(default = "default_acquire_timeout", alias = "DATABASE_CONNECTION_TIMEOUT")]
    pub database_connection_timeout: u64,
    /// Database connection idle timeout in seconds.
    ///
    /// Environment variable: `DATABASE_IDLE_TIMEOUT`
    #[serde(default = "default_idle_timeout", alias = "DATABASE_IDLE_TIMEOUT")]
    pub database_idle_timeout: u64,
    /// Maximum lifetime of database connections in seconds.
    ///
    /// Environment variable: `DATABASE_MAX_LIFETIME`
    #[serde(default = "default_max_lifetime", alias = "DATABASE_MAX_LIFETIME")]
    pub database_max_lifetime: u64,

    // Server
    /// Server bind address.
    ///
    /// Environment variable: `HOST`
    #[serde(default = "default_host", alias = "HOST")]
    pub host: String,
    /// Server bind port.
    ///
    /// Environment variable: `PORT`
    #[serde(default = "default_port", alias = "PORT")]
    pub port: u16,
    /// HTTP request timeout in seconds.
    ///
    /// Environment variable: `REQUEST_TIMEOUT`
    #[serde(default = "default_request_timeout", alias = "REQUEST_TIMEOUT")]
    pub request_timeout: u64,
    /// Largest accepted webhook body in bytes.
    ///
    /// Environment variable: `MAX_BODY_BYTES`
    #[serde(default = "default_max_body_bytes", alias = "MAX_BODY_BYTES")]
    pub max_body_bytes: usize,
    /// Deadline for every backing store call in milliseconds.
    ///
    /// Environment variable: `STORE_TIMEOUT_MS`
    #[serde(default = "default_store_timeout_ms", alias = "STORE_TIMEOUT_MS")]
    pub store_timeout_ms: u64,

    // Webhooks
    /// Shared secret for webhook signatures.
    ///
    /// Environment variable: `WEBHOOK_SECRET`
    #[serde(default, alias = "WEBHOOK_SECRET", skip_serializing)]
    pub webhook_secret: SecretString,
    /// Accepted distance between the webhook timestamp and now, in seconds.
    ///
    /// Environment variable: `WEBHOOK_MAX_SKEW_SECONDS`
    #[serde(default = "default_max_skew", alias = "WEBHOOK_MAX_SKEW_SECONDS")]
    pub webhook_max_skew_seconds: u64,
    /// Header carrying the webhook timestamp.
    ///
    /// Environment variable: `WEBHOOK_TIMESTAMP_HEADER`
    #[serde(default = "default_timestamp_header", alias = "WEBHOOK_TIMESTAMP_HEADER")]
    pub webhook_timestamp_header: String,
    /// Header carrying the `sha256=<hex>` webhook signature.
    ///
    /// Environment variable: `WEBHOOK_SIGNATURE_HEADER`
    #[serde(default = "default_signature_header", alias = "WEBHOOK_SIGNATURE_HEADER")]
    pub webhook_signature_header: String,

    // Rate limiting
    /// Requests allowed per key per UTC minute.
    ///
    /// Environment variable: `RATE_LIMIT_PER_MINUTE`
    #[serde(default = "default_rate_limit", alias = "RATE_LIMIT_PER_MINUTE")]
    pub rate_limit_per_minute: u64,
    /// Outcome when the counter store is unreachable (`open` or `closed`).
    ///
    /// Environment variable: `RATE_LIMIT_FAILURE_MODE`
    #[serde(default, alias = "RATE_LIMIT_FAILURE_MODE")]
    pub rate_limit_failure_mode: FailureMode,
    /// Header naming the calling tenant.
    ///
    /// Environment variable: `TENANT_HEADER`
    #[serde(default = "default_tenant_header", alias = "TENANT_HEADER")]
    pub tenant_header: String,

    // Audit
    /// Whether audit failures fail the audited action.
    ///
    /// Environment variable: `AUDIT_MODE`
    #[serde(default, alias = "AUDIT_MODE")]
    pub audit_mode: AuditMode,

    // Key rotation
    /// Minimum time between promoting a new key and retiring the old one,
    /// in seconds.
    ///
    /// Environment variable: `KEY_GRACE_PERIOD_SECONDS`
    #[serde(default = "default_grace_period", alias = "KEY_GRACE_PERIOD_SECONDS")]
    pub key_grace_period_seconds: u64,
    /// Seconds between scheduled rotation sweeps; `0` disables the sweep.
    ///
    /// Environment variable: `ROTATION_SWEEP_INTERVAL_SECONDS`
    #[serde(default = "default_sweep_interval", alias = "ROTATION_SWEEP_INTERVAL_SECONDS")]
    pub rotation_sweep_interval_seconds: u64,
    /// Rows fetched per sweep batch.
    ///
    /// Environment variable: `ROTATION_BATCH_SIZE`
    #[serde(default = "default_rotation_batch_size", alias = "ROTATION_BATCH_SIZE")]
    pub rotation_batch_size: usize,
    /// Rows re-encrypted concurrently within a batch.
    ///
    /// Environment variable: `ROTATION_CONCURRENCY`
    #[serde(default = "default_rotation_concurrency", alias = "ROTATION_CONCURRENCY")]
    pub rotation_concurrency: usize,
    /// Comma-separated `table.id_column.value_column` targets to sweep.
    ///
    /// Environment variable: `ENCRYPTED_COLUMNS`
    #[serde(default, alias = "ENCRYPTED_COLUMNS")]
    pub encrypted_columns: String,

    // Evidence
    /// Filesystem root of the evidence object store.
    ///
    /// Environment variable: `EVIDENCE_ROOT`
    #[serde(default = "default_evidence_root", alias = "EVIDENCE_ROOT")]
    pub evidence_root: String,
    /// Base URL of issued evidence grants.
    ///
    /// Environment variable: `SIGNED_URL_BASE`
    #[serde(default = "default_signed_url_base", alias = "SIGNED_URL_BASE")]
    pub signed_url_base: String,
    /// Secret signing evidence grants.
    ///
    /// Environment variable: `SIGNED_URL_SECRET`
    #[serde(default, alias = "SIGNED_URL_SECRET", skip_serializing)]
    pub signed_url_secret: SecretString,
    /// Lifetime of an evidence grant in seconds.
    ///
    /// Environment variable: `SIGNED_URL_TTL_SECONDS`
    #[serde(default = "default_signed_url_ttl", alias = "SIGNED_URL_TTL_SECONDS")]
    pub signed_url_ttl_seconds: u64,

    // Logging
    /// Log level configuration.
    ///
    /// Environment variable: `RUST_LOG`
    #[serde(default = "default_log_level", alias = "RUST_LOG")]
    pub rust_log: String,
}

impl Config {
    /// Load configuration from defaults, config file, and environment variable
    /// overrides.
    ///
    /// # Errors
    ///
    /// Returns an error when a source cannot be parsed or validation fails.
    pub fn load() -> Result<Self> {
        let config: Self = Self::figment().extract().context("Failed to load configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Layered configuration sources, lowest priority first.
    pub fn figment() -> Figment {
        Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(CONFIG_FILE))
            .merge(Env::prefixed(""))
    }

    /// Parse server socket address from host and port configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn parse_server_addr(&self) -> Result<SocketAddr> {
        let addr_str = format!("{}:{}", self.host, self.port);
        SocketAddr::from_str(&addr_str).context("Invalid server address")
    }

    /// Get database URL with password masked for logging.
    pub fn database_url_masked(&self) -> String {
        if let Some(at_pos) = self.database_url.find('@') {
            if let Some(colon_pos) = self.database_url[..at_pos].rfind(':') {
                let mut masked = self.database_url.clone();
                masked.replace_range(colon_pos + 1..at_pos, "***");
                return masked;
            }
        }
        self.database_url.clone()
    }

    /// Parses [`Config::encrypted_columns`] into sweep targets.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first target that is not three plain
    /// SQL identifiers.
    pub fn column_targets(&self) -> Result<Vec<ColumnTarget>> {
        self.encrypted_columns
            .split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(|entry| {
                ColumnTarget::parse(entry)
                    .with_context(|| format!("invalid ENCRYPTED_COLUMNS entry {entry:?}"))
            })
            .collect()
    }

    /// Deadline for backing store calls.
    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    /// Deadline for a whole HTTP request.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }

    /// Lifetime of an evidence grant.
    pub fn grant_ttl(&self) -> Duration {
        Duration::from_secs(self.signed_url_ttl_seconds)
    }

    /// Grace window before an old key may be retired.
    pub fn key_grace_period(&self) -> Duration {
        Duration::from_secs(self.key_grace_period_seconds)
    }

    /// Interval of the scheduled rotation sweep, `None` when disabled.
    pub fn rotation_sweep_interval(&self) -> Option<Duration> {
        (self.rotation_sweep_interval_seconds > 0)
            .then(|| Duration::from_secs(self.rotation_sweep_interval_seconds))
    }

    /// Validate configuration values.
    fn validate(&self) -> Result<()> {
        if self.port == 0 {
            anyhow::bail!("port must be greater than 0");
        }

        if self.database_max_connections == 0 {
            anyhow::bail!("database max_connections must be greater than 0");
        }

        if self.database_min_connections > self.database_max_connections {
            anyhow::bail!("database min_connections cannot exceed max_connections");
        }

        if self.max_body_bytes == 0 {
            anyhow::bail!("max_body_bytes must be greater than 0");
        }

        if self.store_timeout_ms == 0 {
            anyhow::bail!("store_timeout_ms must be greater than 0");
        }

        if self.webhook_max_skew_seconds == 0 {
            anyhow::bail!("webhook_max_skew_seconds must be greater than 0");
        }

        if self.rate_limit_per_minute == 0 {
            anyhow::bail!("rate_limit_per_minute must be greater than 0");
        }

        if self.rotation_batch_size == 0 {
            anyhow::bail!("rotation_batch_size must be greater than 0");
        }

        if self.rotation_concurrency == 0 {
            anyhow::bail!("rotation_concurrency must be greater than 0");
        }

        for header in
            [&self.webhook_timestamp_header, &self.webhook_signature_header, &self.tenant_header]
        {
            if axum::http::HeaderName::from_str(header).is_err() {
                anyhow::bail!("{header:?} is not a valid header name");
            }
        }

        self.column_targets()?;

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
            database_max_connections: default_max_connections(),
            database_min_connections: default_min_connections(),
            database_connection_timeout: default_acquire_timeout(),
            database_idle_timeout: default_idle_timeout(),
            database_max_lifetime: default_max_lifetime(),
            host: default_host(),
            port: default_port(),
            request_timeout: default_request_timeout(),
            max_body_bytes: default_max_body_bytes(),
            store_timeout_ms: default_store_timeout_ms(),
            webhook_secret: SecretString::default(),
            webhook_max_skew_seconds: default_max_skew(),
            webhook_timestamp_header: default_timestamp_header(),
            webhook_signature_header: default_signature_header(),
            rate_limit_per_minute: default_rate_limit(),
            rate_limit_failure_mode: FailureMode::default(),
            tenant_header: default_tenant_header(),
            audit_mode: AuditMode::default(),
            key_grace_period_seconds: default_grace_period(),
            rotation_sweep_interval_seconds: default_sweep_interval(),
            rotation_batch_size: default_rotation_batch_size(),
            rotation_concurrency: default_rotation_concurrency(),
            encrypted_columns: String::new(),
            evidence_root: default_evidence_root(),
            signed_url_base: default_signed_url_base(),
            signed_url_secret: SecretString::default(),
            signed_url_ttl_seconds: default_signed_url_ttl(),
            rust_log: default_log_level(),
        }
    }
}

fn default_database_url() -> String {
    "postgresql://localhost/palisade".to_string()
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    2
}

fn default_acquire_timeout() -> u64 {
    10
}

fn default_idle_timeout() -> u64 {
    600
}

fn default_max_lifetime() -> u64 {
    1800
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_request_timeout() -> u64 {
    30
}

fn default_max_body_bytes() -> usize {
    1024 * 1024
}

fn default_store_timeout_ms() -> u64 {
    2000
}

fn default_max_skew() -> u64 {
    300
}

fn default_timestamp_header() -> String {
    "x-webhook-timestamp".to_string()
}

fn default_signature_header() -> String {
    "x-webhook-signature".to_string()
}

fn default_rate_limit() -> u64 {
    120
}

fn default_tenant_header() -> String {
    "x-tenant-id".to_string()
}

fn default_grace_period() -> u64 {
    7 * 24 * 60 * 60
}

fn default_sweep_interval() -> u64 {
    3600
}

fn default_rotation_batch_size() -> usize {
    palisade_crypto::rotation::DEFAULT_BATCH_SIZE
}

fn default_rotation_concurrency() -> usize {
    palisade_crypto::rotation::DEFAULT_CONCURRENCY
}

fn default_evidence_root() -> String {
    "./evidence".to_string()
}

fn default_signed_url_base() -> String {
    "http://127.0.0.1:8080/evidence/files".to_string()
}

fn default_signed_url_ttl() -> u64 {
    300
}

fn default_log_level() -> String {
    "info,palisade=debug,tower_http=debug".to_string()
}
