use anyhow::{Context, Result};
use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use thiserror::Error;

use crate::domain::models::Config;

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid max_concurrency: {0}. Must be between 1 and 256")]
    InvalidMaxConcurrency(usize),

    #[error("invalid log level: {0}. Must be one of: trace, debug, info, warn, error")]
    InvalidLogLevel(String),

    #[error("invalid log format: {0}. Must be one of: json, pretty")]
    InvalidLogFormat(String),

    #[error("registry data_dir cannot be empty")]
    EmptyDataDir,

    #[error("pool workspaces_dir cannot be empty")]
    EmptyWorkspacesDir,

    #[error("invalid rate limit: {0}. Must be positive")]
    InvalidRateLimit(f64),

    #[error("invalid backoff configuration: initial ({0}) must be less than max ({1})")]
    InvalidBackoff(u64, u64),

    #[error("invalid aging configuration: interval must be positive")]
    InvalidAgingInterval,

    #[error("configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Configuration loader with hierarchical merging.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration with hierarchical merging.
    ///
    /// Precedence (lowest to highest):
    /// 1. Programmatic defaults
    /// 2. .necrocode/config.yaml (project config)
    /// 3. .necrocode/local.yaml (local overrides, optional)
    /// 4. Environment variables (NECROCODE_* prefix)
    ///
    /// Configuration is always project-local so multiple deployments per
    /// machine can point at different fleets.
    pub fn load() -> Result<Config> {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(".necrocode/config.yaml"))
            .merge(Yaml::file(".necrocode/local.yaml"))
            .merge(Env::prefixed("NECROCODE_").split("__"))
            .extract()
            .context("failed to extract configuration")?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Load configuration from a specific file.
    pub fn load_from_file(path: impl AsRef<std::path::Path>) -> Result<Config> {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(path.as_ref()))
            .extract()
            .context(format!("failed to load config from {}", path.as_ref().display()))?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Validate configuration after loading.
    pub fn validate(config: &Config) -> Result<(), ConfigError> {
        if config.dispatcher.max_concurrency == 0 || config.dispatcher.max_concurrency > 256 {
            return Err(ConfigError::InvalidMaxConcurrency(config.dispatcher.max_concurrency));
        }
        if config.dispatcher.aging_interval_secs == 0 {
            return Err(ConfigError::InvalidAgingInterval);
        }
        if config.dispatcher.retry_initial_backoff_secs >= config.dispatcher.retry_max_backoff_secs {
            return Err(ConfigError::InvalidBackoff(
                config.dispatcher.retry_initial_backoff_secs,
                config.dispatcher.retry_max_backoff_secs,
            ));
        }

        if config.registry.data_dir.is_empty() {
            return Err(ConfigError::EmptyDataDir);
        }
        if config.pool.workspaces_dir.is_empty() {
            return Err(ConfigError::EmptyWorkspacesDir);
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&config.logging.level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(config.logging.level.clone()));
        }
        let valid_log_formats = ["json", "pretty"];
        if !valid_log_formats.contains(&config.logging.format.as_str()) {
            return Err(ConfigError::InvalidLogFormat(config.logging.format.clone()));
        }

        if config.llm.requests_per_second <= 0.0 {
            return Err(ConfigError::InvalidRateLimit(config.llm.requests_per_second));
        }
        if config.llm.initial_backoff_ms >= config.llm.max_backoff_ms {
            return Err(ConfigError::InvalidBackoff(
                config.llm.initial_backoff_ms,
                config.llm.max_backoff_ms,
            ));
        }

        if config.secrets.llm_api_key_env.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "secrets.llm_api_key_env cannot be empty".to_string(),
            ));
        }

        Ok(())
    }
}
