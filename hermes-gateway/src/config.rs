//! # Configuration Management
//!
//! The gateway loads a TOML file, then applies environment overrides so a
//! container deployment can run with no file at all: `PORT`,
//! `HERMES_SECRET`, `DB_PATH`, `RATE_LIMIT_MAX`, `RATE_LIMIT_WINDOW`,
//! plus `HERMES_HOST` and `HERMES_LOG_LEVEL`.
//!
//! Static configuration seeds the runtime-tunable settings (retries,
//! breaker penalties, sync cadence, rate limits); values persisted through
//! the admin settings API take precedence over the file on the next boot.
//!
//! `validate()` failures are configuration errors and map to exit code 2
//! in the binary.

use hermes_core::normalizer::AliasTable;
use hermes_core::proxy::ProxyConfig;
use hermes_core::settings::SettingsValues;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// HTTP server binding and limits
    pub server: ServerConfig,
    /// Database location
    pub store: StoreConfig,
    /// Gateway authentication and admission control
    pub auth: AuthConfig,
    /// Dispatch, retry, and breaker tuning
    pub dispatcher: DispatcherConfig,
    /// Upstream proxy tuning and failure classification markers
    pub proxy: ProxySection,
    /// Model identifier alias table
    pub models: AliasTable,
    /// Logging configuration
    pub logging: LoggingConfig,
    /// Log sink queue tuning
    pub log_sink: LogSinkSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Budget for producing response headers; streams run past it.
    pub timeout_secs: u64,
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8000,
            timeout_secs: 125,
            max_body_bytes: 2 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub db_path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: "hermes.db".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Backdoor secret accepted on the admin surface. No default; admin
    /// endpoints reject everything until a secret or admin key exists.
    pub secret: Option<String>,
    pub rate_limit_max: u32,
    pub rate_limit_window_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            secret: None,
            rate_limit_max: 60,
            rate_limit_window_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    pub chat_max_retries: u32,
    pub initial_penalty_ms: u64,
    pub max_penalty_ms: u64,
    pub resync_threshold: u32,
    pub periodic_sync_interval_hours: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            chat_max_retries: 3,
            initial_penalty_ms: 30 * 60 * 1000,
            max_penalty_ms: 4 * 60 * 60 * 1000,
            resync_threshold: 3,
            periodic_sync_interval_hours: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxySection {
    pub connect_timeout_secs: u64,
    pub request_timeout_secs: u64,
    pub stream_idle_timeout_secs: u64,
    pub max_idle_per_host: usize,
    pub max_response_bytes: usize,
    pub quota_markers: Vec<String>,
    pub model_missing_markers: Vec<String>,
}

impl Default for ProxySection {
    fn default() -> Self {
        let d = ProxyConfig::default();
        Self {
            connect_timeout_secs: d.connect_timeout.as_secs(),
            request_timeout_secs: d.request_timeout.as_secs(),
            stream_idle_timeout_secs: d.stream_idle_timeout.as_secs(),
            max_idle_per_host: d.max_idle_per_host,
            max_response_bytes: d.max_response_bytes,
            quota_markers: d.quota_markers,
            model_missing_markers: d.model_missing_markers,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSinkSection {
    pub queue_capacity: usize,
    pub request_hard_cap: usize,
    pub batch_max: usize,
    pub flush_interval_ms: u64,
}

impl Default for LogSinkSection {
    fn default() -> Self {
        let d = hermes_core::log_sink::LogSinkConfig::default();
        Self {
            queue_capacity: d.queue_capacity,
            request_hard_cap: d.request_hard_cap,
            batch_max: d.batch_max,
            flush_interval_ms: d.flush_interval.as_millis() as u64,
        }
    }
}

impl Config {
    /// Load the file (falling back to defaults when it does not exist)
    /// and apply environment overrides.
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let mut config = match std::fs::read_to_string(path) {
            Ok(content) => toml::from_str(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(path, "config file not found, using defaults");
                Config::default()
            }
            Err(e) => return Err(e.into()),
        };
        config.apply_env_overrides()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) -> anyhow::Result<()> {
        if let Ok(host) = env::var("HERMES_HOST") {
            self.server.host = host;
        }
        if let Ok(port) = env::var("PORT") {
            self.server.port = port
                .parse()
                .map_err(|_| anyhow::anyhow!("PORT '{port}' is not a valid port number"))?;
        }
        if let Ok(secret) = env::var("HERMES_SECRET") {
            self.auth.secret = Some(secret);
        }
        if let Ok(db_path) = env::var("DB_PATH") {
            self.store.db_path = db_path;
        }
        if let Ok(max) = env::var("RATE_LIMIT_MAX") {
            self.auth.rate_limit_max = max
                .parse()
                .map_err(|_| anyhow::anyhow!("RATE_LIMIT_MAX '{max}' is not a number"))?;
        }
        if let Ok(window) = env::var("RATE_LIMIT_WINDOW") {
            self.auth.rate_limit_window_secs = window
                .parse()
                .map_err(|_| anyhow::anyhow!("RATE_LIMIT_WINDOW '{window}' is not a number"))?;
        }
        if let Ok(level) = env::var("HERMES_LOG_LEVEL") {
            self.logging.level = level;
        }
        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.server.port == 0 {
            anyhow::bail!("server.port must not be zero");
        }
        if self.server.max_body_bytes == 0 {
            anyhow::bail!("server.max_body_bytes must not be zero");
        }
        if self.auth.rate_limit_max == 0 {
            anyhow::bail!("auth.rate_limit_max must not be zero");
        }
        if self.auth.rate_limit_window_secs < 5 {
            anyhow::bail!("auth.rate_limit_window_secs must be at least 5");
        }
        if self.dispatcher.chat_max_retries == 0 {
            anyhow::bail!("dispatcher.chat_max_retries must not be zero");
        }
        if self.dispatcher.initial_penalty_ms == 0
            || self.dispatcher.initial_penalty_ms > self.dispatcher.max_penalty_ms
        {
            anyhow::bail!("dispatcher penalties must satisfy 0 < initial <= max");
        }
        if self.proxy.max_response_bytes == 0 {
            anyhow::bail!("proxy.max_response_bytes must not be zero");
        }
        Ok(())
    }

    /// Defaults for the runtime-tunable settings, seeded from this file.
    pub fn settings_defaults(&self) -> SettingsValues {
        SettingsValues {
            periodic_sync_interval: Duration::from_secs(
                self.dispatcher.periodic_sync_interval_hours * 3600,
            ),
            chat_max_retries: self.dispatcher.chat_max_retries,
            initial_penalty: Duration::from_millis(self.dispatcher.initial_penalty_ms),
            max_penalty: Duration::from_millis(self.dispatcher.max_penalty_ms),
            resync_threshold: self.dispatcher.resync_threshold,
            rate_limit_max: self.auth.rate_limit_max,
            rate_limit_window: Duration::from_secs(self.auth.rate_limit_window_secs),
        }
    }

    pub fn proxy_config(&self) -> ProxyConfig {
        ProxyConfig {
            connect_timeout: Duration::from_secs(self.proxy.connect_timeout_secs),
            request_timeout: Duration::from_secs(self.proxy.request_timeout_secs),
            stream_idle_timeout: Duration::from_secs(self.proxy.stream_idle_timeout_secs),
            max_idle_per_host: self.proxy.max_idle_per_host,
            max_response_bytes: self.proxy.max_response_bytes,
            quota_markers: self.proxy.quota_markers.clone(),
            model_missing_markers: self.proxy.model_missing_markers.clone(),
        }
    }

    pub fn log_sink_config(&self) -> hermes_core::log_sink::LogSinkConfig {
        hermes_core::log_sink::LogSinkConfig {
            queue_capacity: self.log_sink.queue_capacity,
            request_hard_cap: self.log_sink.request_hard_cap,
            batch_max: self.log_sink.batch_max,
            flush_interval: Duration::from_millis(self.log_sink.flush_interval_ms),
        }
    }
}
