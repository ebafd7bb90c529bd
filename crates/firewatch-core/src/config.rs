use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{CoreError, Result};

pub const DEFAULT_PORT: u16 = 18790;
pub const DEFAULT_BIND: &str = "127.0.0.1";
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_DELETE_BATCH_SIZE: usize = 1000;
pub const DEFAULT_PAGE_DELAY_MS: u64 = 1000; // upstream rate limit: ~1 page/s
pub const DEFAULT_SINCE_PAD_SECS: i64 = 60; // tolerates upstream clock skew
pub const DEFAULT_DIFF_WINDOW_SECS: i64 = 300; // older records are assumed final

/// Top-level config (firewatch.toml + FIREWATCH_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FirewatchConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind: DEFAULT_BIND.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Third-party dispatch API. Both credentials are optional at load time;
/// a routine that needs them reports `ConfigurationMissing` when started.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    pub base_url: Option<String>,
    pub api_token: Option<String>,
    /// Per-attempt transport timeout. There is no deadline across attempts.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            api_token: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl UpstreamConfig {
    /// Base URL with any trailing slash removed, or `ConfigurationMissing`.
    pub fn require_base_url(&self) -> Result<&str> {
        match self.base_url.as_deref().map(str::trim) {
            Some(url) if !url.is_empty() => Ok(url.trim_end_matches('/')),
            _ => Err(CoreError::ConfigurationMissing {
                key: "upstream.base_url".to_string(),
            }),
        }
    }

    pub fn require_api_token(&self) -> Result<&str> {
        match self.api_token.as_deref() {
            Some(token) if !token.is_empty() => Ok(token),
            _ => Err(CoreError::ConfigurationMissing {
                key: "upstream.api_token".to_string(),
            }),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Backoff settings shared by every upstream call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// Fraction of the capped delay added as random jitter, in `[0, 1]`.
    #[serde(default = "default_jitter_max")]
    pub jitter_max: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter_max: default_jitter_max(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    #[serde(default = "default_poll_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_delete_batch_size")]
    pub delete_batch_size: usize,
    #[serde(default = "default_page_delay_ms")]
    pub page_delay_ms: u64,
    #[serde(default = "default_since_pad_secs")]
    pub since_pad_secs: i64,
    #[serde(default = "default_diff_window_secs")]
    pub diff_window_secs: i64,
    /// Start polling as soon as the gateway is listening.
    #[serde(default)]
    pub auto_start: bool,
    /// Incident type names registered in the store when the routine starts.
    /// Records whose type matches one of these (case-insensitively) get its
    /// `type_id`; other types are stored without one.
    #[serde(default)]
    pub incident_types: Vec<String>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            delete_batch_size: DEFAULT_DELETE_BATCH_SIZE,
            page_delay_ms: DEFAULT_PAGE_DELAY_MS,
            since_pad_secs: DEFAULT_SINCE_PAD_SECS,
            diff_window_secs: DEFAULT_DIFF_WINDOW_SECS,
            auto_start: false,
            incident_types: Vec::new(),
        }
    }
}

impl DispatchConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn page_delay(&self) -> Duration {
        Duration::from_millis(self.page_delay_ms)
    }
}

fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_max_retries() -> u32 {
    3
}
fn default_base_delay_ms() -> u64 {
    1000
}
fn default_max_delay_ms() -> u64 {
    30_000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_jitter_max() -> f64 {
    0.1
}
fn default_poll_interval_secs() -> u64 {
    DEFAULT_POLL_INTERVAL_SECS
}
fn default_delete_batch_size() -> usize {
    DEFAULT_DELETE_BATCH_SIZE
}
fn default_page_delay_ms() -> u64 {
    DEFAULT_PAGE_DELAY_MS
}
fn default_since_pad_secs() -> i64 {
    DEFAULT_SINCE_PAD_SECS
}
fn default_diff_window_secs() -> i64 {
    DEFAULT_DIFF_WINDOW_SECS
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.firewatch/firewatch.db", home)
}

impl FirewatchConfig {
    /// Load config from a TOML file with FIREWATCH_* env var overrides.
    ///
    /// Nested keys use a double underscore in the environment, e.g.
    /// `FIREWATCH_UPSTREAM__API_TOKEN` sets `upstream.api_token`.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        Self::from_figment(
            Figment::new()
                .merge(Toml::file(&path))
                .merge(Env::prefixed("FIREWATCH_").split("__")),
        )
    }

    fn from_figment(figment: Figment) -> Result<Self> {
        let mut config: FirewatchConfig = figment
            .extract()
            .map_err(|e| CoreError::Config(e.to_string()))?;
        let jitter = config.retry.jitter_max.clamp(0.0, 1.0);
        if jitter != config.retry.jitter_max {
            warn!(
                configured = config.retry.jitter_max,
                used = jitter,
                "retry.jitter_max out of range; clamped"
            );
            config.retry.jitter_max = jitter;
        }
        if config.retry.backoff_multiplier < 1.0 {
            return Err(CoreError::Config(format!(
                "retry.backoff_multiplier must be >= 1.0 (got {})",
                config.retry.backoff_multiplier
            )));
        }
        Ok(config)
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.firewatch/firewatch.toml", home)
}
