//! Application configuration with layered loading.
//!
//! This module provides configuration management using figment for layered
//! configuration loading from multiple sources:
//!
//! 1. Environment variables (SYNCCACHE_*)
//! 2. TOML config file (if SYNCCACHE_CONFIG_FILE set)
//! 3. Built-in defaults

use std::path::PathBuf;
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

mod validation;

pub use validation::ConfigError;

/// Application configuration with layered loading.
///
/// Loading precedence (highest wins):
/// 1. Environment variables (SYNCCACHE_*)
/// 2. TOML config file (if SYNCCACHE_CONFIG_FILE set)
/// 3. Built-in defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Path to the SQLite database shared by the foreground and the worker.
    ///
    /// Set via SYNCCACHE_DB_PATH environment variable.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Name of the cache inside the database.
    ///
    /// Set via SYNCCACHE_CACHE_NAME environment variable.
    #[serde(default = "default_cache_name")]
    pub cache_name: String,

    /// TTL applied when a request does not carry one, in milliseconds.
    /// `0` means entries never expire by TTL.
    ///
    /// Set via SYNCCACHE_DEFAULT_TTL_MS environment variable.
    #[serde(default)]
    pub default_ttl_ms: u64,

    /// Network attempts per fetch before giving up.
    ///
    /// Set via SYNCCACHE_FETCH_ATTEMPTS environment variable.
    #[serde(default = "default_fetch_attempts")]
    pub fetch_attempts: u32,

    /// HTTP request timeout in milliseconds.
    ///
    /// Set via SYNCCACHE_TIMEOUT_MS environment variable.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// User-Agent string for HTTP requests.
    ///
    /// Set via SYNCCACHE_USER_AGENT environment variable.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// WebSocket endpoint of the push channel. When unset the daemon reads
    /// newline-delimited push messages from stdin.
    ///
    /// Set via SYNCCACHE_PUSH_URL environment variable.
    #[serde(default)]
    pub push_url: Option<String>,

    /// Push messages older than this are dropped, in milliseconds.
    ///
    /// Set via SYNCCACHE_PUSH_MAX_AGE_MS environment variable.
    #[serde(default = "default_push_max_age_ms")]
    pub push_max_age_ms: u64,

    /// Interval of the worker's background refresh, in milliseconds.
    /// Disabled when unset.
    ///
    /// Set via SYNCCACHE_REFRESH_INTERVAL_MS environment variable.
    #[serde(default)]
    pub refresh_interval_ms: Option<u64>,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("./synccache.sqlite")
}

fn default_cache_name() -> String {
    "api:lm".into()
}

fn default_fetch_attempts() -> u32 {
    3
}

fn default_timeout_ms() -> u64 {
    20_000
}

fn default_user_agent() -> String {
    "synccache/0.1".into()
}

fn default_push_max_age_ms() -> u64 {
    10_000
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            cache_name: default_cache_name(),
            default_ttl_ms: 0,
            fetch_attempts: default_fetch_attempts(),
            timeout_ms: default_timeout_ms(),
            user_agent: default_user_agent(),
            push_url: None,
            push_max_age_ms: default_push_max_age_ms(),
            refresh_interval_ms: None,
        }
    }
}

impl AppConfig {
    /// Timeout as Duration for use with reqwest/tokio.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Maximum accepted push message age.
    pub fn push_max_age(&self) -> Duration {
        Duration::from_millis(self.push_max_age_ms)
    }

    /// Background refresh interval, if enabled.
    pub fn refresh_interval(&self) -> Option<Duration> {
        self.refresh_interval_ms.map(Duration::from_millis)
    }

    /// Load configuration from all sources with layered precedence.
    ///
    /// Priority (highest wins):
    /// 1. Environment variables prefixed with `SYNCCACHE_`
    /// 2. TOML file from `SYNCCACHE_CONFIG_FILE` (if set)
    /// 3. Built-in defaults via `Default::default()`
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if:
    /// - Configuration file cannot be read
    /// - Environment variables cannot be parsed
    /// - Validation fails after loading
    pub fn load() -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));

        if let Ok(config_path) = std::env::var("SYNCCACHE_CONFIG_FILE") {
            figment = figment.merge(Toml::file(&config_path));
        }

        figment = figment.merge(
            Env::prefixed("SYNCCACHE_")
                .ignore(&["CONFIG_FILE"])
                .map(|key| key.as_str().to_lowercase().into())
                .split("__"),
        );

        let config: Self = figment.extract().map_err(|e| ConfigError::LoadFailed(e.to_string()))?;

        config.validate()?;

        Ok(config)
    }
}
