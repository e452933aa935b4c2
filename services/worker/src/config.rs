//! services/worker/src/config.rs
//!
//! Defines the worker's configuration structure and loading logic.
//!
//! All configuration is loaded from environment variables at startup. The `.env`
//! file is used for local development.

use likeshelf_core::QuotaPolicy;
use std::str::FromStr;
use std::time::Duration;
use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing the environment variable {0}")]
    MissingVar(String),
    #[error("Invalid value for the environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub log_level: Level,
    pub openai_api_key: Option<String>,
    pub classifier_model: String,
    pub youtube_api_base: String,
    pub source_timeout: Duration,
    pub quota_policy: QuotaPolicy,
    pub sync_interval: Duration,
    pub user_concurrency: usize,
    pub classifier_concurrency: usize,
    pub full_sync_cooldown: Duration,
    pub run_once: bool,
}

impl Config {
    /// Loads configuration from environment variables.
    ///
    /// It will look for a `.env` file in the current directory for development,
    /// but this is skipped in test environments to ensure tests are hermetic.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination.
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        // --- Database and Logging ---
        let database_url =
            lookup("DATABASE_URL").ok_or_else(|| ConfigError::MissingVar("DATABASE_URL".to_string()))?;

        let log_level_str = lookup("RUST_LOG").unwrap_or_else(|| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        // --- Adapters ---
        let openai_api_key = lookup("OPENAI_API_KEY").filter(|key| !key.trim().is_empty());
        let classifier_model =
            lookup("CLASSIFIER_MODEL").unwrap_or_else(|| "gpt-4o-mini".to_string());
        let youtube_api_base = lookup("YOUTUBE_API_BASE")
            .unwrap_or_else(|| "https://www.googleapis.com/youtube/v3".to_string())
            .trim_end_matches('/')
            .to_string();
        let source_timeout = Duration::from_secs(parse_or(&lookup, "SOURCE_TIMEOUT_SECS", 20)?);

        // --- Quota ---
        let reset_day: u32 = parse_or(&lookup, "QUOTA_RESET_DAY", 1)?;
        if !(1..=28).contains(&reset_day) {
            return Err(ConfigError::InvalidValue(
                "QUOTA_RESET_DAY".to_string(),
                format!("{} is outside 1..=28", reset_day),
            ));
        }

        // --- Run Loop ---
        let sync_interval = Duration::from_secs(
            positive(parse_or(&lookup, "SYNC_INTERVAL_SECS", 900)?, "SYNC_INTERVAL_SECS")? as u64,
        );
        let user_concurrency = positive(parse_or(&lookup, "USER_CONCURRENCY", 4)?, "USER_CONCURRENCY")?;
        let classifier_concurrency = positive(
            parse_or(&lookup, "CLASSIFIER_CONCURRENCY", 3)?,
            "CLASSIFIER_CONCURRENCY",
        )?;
        let full_sync_cooldown =
            Duration::from_secs(parse_or(&lookup, "FULL_SYNC_COOLDOWN_SECS", 300)?);
        let run_once = parse_or(&lookup, "RUN_ONCE", false)?;

        Ok(Self {
            database_url,
            log_level,
            openai_api_key,
            classifier_model,
            youtube_api_base,
            source_timeout,
            quota_policy: QuotaPolicy { reset_day },
            sync_interval,
            user_concurrency,
            classifier_concurrency,
            full_sync_cooldown,
            run_once,
        })
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| ConfigError::InvalidValue(key.to_string(), e.to_string())),
    }
}

fn positive(value: usize, key: &str) -> Result<usize, ConfigError> {
    if value == 0 {
        return Err(ConfigError::InvalidValue(key.to_string(), "must be at least 1".to_string()));
    }
    Ok(value)
}
