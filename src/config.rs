//! Configuration types.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// Service configuration.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Address to bind the HTTP server on.
    pub host: String,
    /// Port to bind the HTTP server on.
    pub port: u16,
    /// Maximum number of downloads in `starting`/`running` at once.
    pub max_concurrent_downloads: usize,
    /// Timeout handed to the chat source when a request omits one.
    pub default_timeout: Duration,
    /// Ceiling for requested timeouts.
    pub max_timeout: Duration,
    /// Ceiling for requested `max_messages`.
    pub max_messages_limit: u64,
    /// Directory artifacts are written to.
    pub download_dir: PathBuf,
    /// Slack beyond a job's timeout before the runner gives up on its source.
    pub watchdog_grace: Duration,
    /// Base URL of the external chat retrieval service.
    pub chat_source_url: Option<String>,
    /// Fallback log filter when `RUST_LOG` is unset.
    pub log_level: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5000,
            max_concurrent_downloads: 10,
            default_timeout: Duration::from_secs(7200), // 2 hours
            max_timeout: Duration::from_secs(7200),
            max_messages_limit: 50_000,
            download_dir: std::env::temp_dir(),
            watchdog_grace: Duration::from_secs(30),
            chat_source_url: None,
            log_level: "info".to_string(),
        }
    }
}

impl ServiceConfig {
    /// Build configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let default_timeout =
            parse_or(&lookup, "DEFAULT_TIMEOUT", defaults.default_timeout.as_secs())?;
        // The legacy deployment used DEFAULT_TIMEOUT as both default and ceiling.
        let max_timeout = parse_or(&lookup, "MAX_TIMEOUT", default_timeout)?;

        let config = Self {
            host: lookup("HOST").unwrap_or(defaults.host),
            port: parse_or(&lookup, "PORT", defaults.port)?,
            max_concurrent_downloads: parse_or(
                &lookup,
                "MAX_CONCURRENT_DOWNLOADS",
                defaults.max_concurrent_downloads,
            )?,
            default_timeout: Duration::from_secs(default_timeout),
            max_timeout: Duration::from_secs(max_timeout),
            max_messages_limit: parse_or(
                &lookup,
                "MAX_MESSAGES_LIMIT",
                defaults.max_messages_limit,
            )?,
            download_dir: lookup("DOWNLOAD_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.download_dir),
            watchdog_grace: Duration::from_secs(parse_or(
                &lookup,
                "WATCHDOG_GRACE_SECS",
                defaults.watchdog_grace.as_secs(),
            )?),
            chat_source_url: lookup("CHAT_SOURCE_URL").filter(|s| !s.trim().is_empty()),
            log_level: lookup("LOG_LEVEL")
                .map(|s| s.to_lowercase())
                .unwrap_or(defaults.log_level),
        };

        if config.max_concurrent_downloads == 0 {
            return Err(ConfigError::InvalidValue {
                key: "MAX_CONCURRENT_DOWNLOADS".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        Ok(config)
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("{raw:?}: {e}"),
        }),
    }
}
