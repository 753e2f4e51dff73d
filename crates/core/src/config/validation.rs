//! Configuration validation rules.
//!
//! This module provides validation logic for `AppConfig` values
//! after they have been loaded from environment, files, or defaults.

use crate::config::AppConfig;
use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    LoadFailed(String),

    #[error("invalid configuration: {field} - {reason}")]
    Invalid { field: String, reason: String },

    #[error("missing required configuration: {field} ({hint})")]
    Missing { field: String, hint: String },
}

impl AppConfig {
    /// Validate configuration values after loading.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Missing` if `db_path` is empty, and
    /// `ConfigError::Invalid` if:
    /// - `cache_name` is empty
    /// - `fetch_attempts` is 0 or greater than 10
    /// - `timeout_ms` is less than 100ms or exceeds 5 minutes
    /// - `user_agent` is empty
    /// - `refresh_interval_ms` is set below one second
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.db_path.as_os_str().is_empty() {
            return Err(ConfigError::Missing {
                field: "db_path".into(),
                hint: "Set SYNCCACHE_DB_PATH environment variable".into(),
            });
        }

        if self.cache_name.trim().is_empty() {
            return Err(ConfigError::Invalid { field: "cache_name".into(), reason: "must not be empty".into() });
        }

        if self.fetch_attempts == 0 {
            return Err(ConfigError::Invalid { field: "fetch_attempts".into(), reason: "must be at least 1".into() });
        }
        if self.fetch_attempts > 10 {
            return Err(ConfigError::Invalid { field: "fetch_attempts".into(), reason: "must not exceed 10".into() });
        }

        if self.timeout_ms < 100 {
            return Err(ConfigError::Invalid { field: "timeout_ms".into(), reason: "must be at least 100ms".into() });
        }
        if self.timeout_ms > 300_000 {
            return Err(ConfigError::Invalid {
                field: "timeout_ms".into(),
                reason: "must not exceed 5 minutes (300000ms)".into(),
            });
        }

        if self.user_agent.is_empty() {
            return Err(ConfigError::Invalid { field: "user_agent".into(), reason: "must not be empty".into() });
        }

        if let Some(interval) = self.refresh_interval_ms
            && interval < 1_000
        {
            return Err(ConfigError::Invalid {
                field: "refresh_interval_ms".into(),
                reason: "must be at least 1000ms".into(),
            });
        }

        if self.push_max_age_ms == 0 {
            tracing::warn!("push_max_age_ms is 0; every timestamped push message will be dropped");
        }

        Ok(())
    }
}
