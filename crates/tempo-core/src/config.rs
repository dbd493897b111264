//! Environment-driven application configuration.
//!
//! Every component consumes the same validated [`Config`]; an invalid value
//! refuses to construct, which the binaries turn into a startup abort.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::types::DEFAULT_LLM_MODEL;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Log output flavour for the tracing subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Standard,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "standard" => Ok(LogFormat::Standard),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("expected 'json' or 'standard', got '{other}'")),
        }
    }
}

/// Validated process configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Credential for the OpenRouter endpoint.
    pub openrouter_api_key: String,
    /// SQLite database path (a `sqlite://` prefix is tolerated).
    pub database_url: String,
    /// Default model identifier, `provider/model`.
    pub llm_model: String,
    /// Reconcile cadence in seconds, in (0, 3600].
    pub scheduler_interval_seconds: u64,
    /// Whether the background reconciler runs at all.
    pub scheduler_enabled: bool,
    /// Hour of day the fallback window opens, 0..=23.
    pub fallback_start_hour: u32,
    /// Fallback window length in hours, > 0.
    pub fallback_duration_hours: i64,
    /// Age past which audit and chat rows are trimmed, > 0.
    pub retention_days: i64,
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub log_format: LogFormat,
}

impl Config {
    /// Read configuration from the environment and validate it.
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Self {
            openrouter_api_key: std::env::var("OPENROUTER_API_KEY")
                .map_err(|_| ConfigError::Missing("OPENROUTER_API_KEY"))?,
            database_url: var_or("DATABASE_URL", "tasks.db"),
            llm_model: var_or("LLM_MODEL", DEFAULT_LLM_MODEL),
            scheduler_interval_seconds: parse_var("SCHEDULER_INTERVAL_SECONDS", 5)?,
            scheduler_enabled: parse_var("SCHEDULER_ENABLED", true)?,
            fallback_start_hour: parse_var("FALLBACK_START_HOUR", 9)?,
            fallback_duration_hours: parse_var("FALLBACK_DURATION_HOURS", 1)?,
            retention_days: parse_var("RETENTION_DAYS", 30)?,
            host: var_or("HOST", "0.0.0.0"),
            port: parse_var("PORT", 5000)?,
            log_level: var_or("LOG_LEVEL", "info"),
            log_format: parse_var("LOG_FORMAT", LogFormat::Standard)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Enforce the value constraints. Called by [`Config::from_env`]; also
    /// usable directly on hand-built configs.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.openrouter_api_key.trim().is_empty() {
            return Err(ConfigError::Invalid {
                key: "OPENROUTER_API_KEY",
                reason: "must not be empty".into(),
            });
        }
        if self.database_url.trim().is_empty() {
            return Err(ConfigError::Invalid {
                key: "DATABASE_URL",
                reason: "must not be empty".into(),
            });
        }
        if !self.llm_model.contains('/') {
            return Err(ConfigError::Invalid {
                key: "LLM_MODEL",
                reason: format!("'{}' is not of the form provider/model", self.llm_model),
            });
        }
        if self.scheduler_interval_seconds == 0 || self.scheduler_interval_seconds > 3600 {
            return Err(ConfigError::Invalid {
                key: "SCHEDULER_INTERVAL_SECONDS",
                reason: format!(
                    "{} is outside (0, 3600]",
                    self.scheduler_interval_seconds
                ),
            });
        }
        if self.fallback_start_hour > 23 {
            return Err(ConfigError::Invalid {
                key: "FALLBACK_START_HOUR",
                reason: format!("{} is outside [0, 23]", self.fallback_start_hour),
            });
        }
        if self.fallback_duration_hours <= 0 {
            return Err(ConfigError::Invalid {
                key: "FALLBACK_DURATION_HOURS",
                reason: "must be positive".into(),
            });
        }
        if self.retention_days <= 0 {
            return Err(ConfigError::Invalid {
                key: "RETENTION_DAYS",
                reason: "must be positive".into(),
            });
        }
        Ok(())
    }

    /// Filesystem path of the SQLite database.
    pub fn database_path(&self) -> &str {
        self.database_url
            .strip_prefix("sqlite://")
            .or_else(|| self.database_url.strip_prefix("sqlite:"))
            .unwrap_or(&self.database_url)
    }
}

fn var_or(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn parse_var<T>(key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) if !raw.is_empty() => raw.parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            reason: e.to_string(),
        }),
        _ => Ok(default),
    }
}
