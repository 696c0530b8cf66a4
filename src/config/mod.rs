//! Engine configuration, read once at startup.
//!
//! Environment variables use the `SKIPTRACE_` prefix and are treated as
//! immutable at runtime. Money is integer cents throughout.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required configuration: {key}")]
    Missing { key: &'static str },

    #[error("invalid value for {key}: {message}")]
    Invalid { key: &'static str, message: String },
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Everything the engine needs to run.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Stable identifier of the external source.
    pub provider_name: String,
    /// Provider base endpoint.
    pub base_url: String,
    /// Provider credential. Redacted in Debug output.
    pub api_key: SecretString,
    /// Lookup path appended to `base_url`.
    pub lookup_path: String,
    /// Daily spend ceiling, in cents, per UTC day.
    pub daily_cap_cents: u64,
    /// Known per-call provider price, in cents.
    pub cost_per_call_cents: u32,
    /// Cache validity window.
    pub cache_ttl: Duration,
    /// Worker pool size when driving a run.
    pub max_concurrency: usize,
    /// Provider request timeout.
    pub request_timeout: Duration,
    /// Provider calls admitted per second (0 = unlimited).
    pub rate_limit_per_sec: u32,
    /// Total execution attempts per item, first try included.
    pub max_attempts: u32,
    /// Directory for the JSONL stores.
    pub data_dir: PathBuf,
    /// Whether cache hits leave zero-cost ledger rows.
    pub record_cache_hits: bool,
}

impl EngineConfig {
    /// Defaults for everything except the provider endpoint/credential.
    pub fn new(base_url: impl Into<String>, api_key: SecretString) -> Self {
        Self {
            provider_name: "skiptrace".to_string(),
            base_url: base_url.into(),
            api_key,
            lookup_path: "/v1/lookup".to_string(),
            daily_cap_cents: 10_000,
            cost_per_call_cents: 25,
            cache_ttl: Duration::from_secs(7 * 24 * 60 * 60),
            max_concurrency: 4,
            request_timeout: Duration::from_secs(15),
            rate_limit_per_sec: 5,
            max_attempts: 3,
            data_dir: PathBuf::from("./skiptrace-data"),
            record_cache_hits: true,
        }
    }

    /// Read the full configuration from `SKIPTRACE_*` environment
    /// variables. `SKIPTRACE_BASE_URL` and `SKIPTRACE_API_KEY` are
    /// required; everything else has a default.
    pub fn from_env() -> ConfigResult<Self> {
        let base_url = require("SKIPTRACE_BASE_URL")?;
        let api_key = SecretString::from(require("SKIPTRACE_API_KEY")?);

        let mut config = Self::new(base_url, api_key);
        if let Some(name) = optional::<String>("SKIPTRACE_PROVIDER_NAME")? {
            config.provider_name = name;
        }
        if let Some(path) = optional::<String>("SKIPTRACE_LOOKUP_PATH")? {
            config.lookup_path = path;
        }
        if let Some(cap) = optional("SKIPTRACE_DAILY_CAP_CENTS")? {
            config.daily_cap_cents = cap;
        }
        if let Some(cost) = optional("SKIPTRACE_COST_PER_CALL_CENTS")? {
            config.cost_per_call_cents = cost;
        }
        if let Some(days) = optional::<u64>("SKIPTRACE_CACHE_TTL_DAYS")? {
            config.cache_ttl = Duration::from_secs(days * 24 * 60 * 60);
        }
        if let Some(workers) = optional("SKIPTRACE_MAX_CONCURRENCY")? {
            config.max_concurrency = workers;
        }
        if let Some(secs) = optional::<u64>("SKIPTRACE_REQUEST_TIMEOUT_SECS")? {
            config.request_timeout = Duration::from_secs(secs);
        }
        if let Some(rate) = optional("SKIPTRACE_RATE_LIMIT_PER_SEC")? {
            config.rate_limit_per_sec = rate;
        }
        if let Some(attempts) = optional("SKIPTRACE_MAX_ATTEMPTS")? {
            config.max_attempts = attempts;
        }
        if let Some(dir) = optional::<String>("SKIPTRACE_DATA_DIR")? {
            config.data_dir = PathBuf::from(dir);
        }
        if let Some(record) = optional("SKIPTRACE_RECORD_CACHE_HITS")? {
            config.record_cache_hits = record;
        }
        Ok(config)
    }
}

fn require(key: &'static str) -> ConfigResult<String> {
    match std::env::var(key) {
        Ok(value) if !value.is_empty() => Ok(value),
        _ => Err(ConfigError::Missing { key }),
    }
}

fn optional<T: FromStr>(key: &'static str) -> ConfigResult<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(value) if !value.is_empty() => {
            value
                .parse::<T>()
                .map(Some)
                .map_err(|e| ConfigError::Invalid {
                    key,
                    message: e.to_string(),
                })
        }
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::new("https://api.example.com", "key".into());
        assert_eq!(config.daily_cap_cents, 10_000);
        assert_eq!(config.cost_per_call_cents, 25);
        assert_eq!(config.request_timeout, Duration::from_secs(15));
        assert_eq!(config.max_attempts, 3);
        assert!(config.record_cache_hits);
    }

    #[test]
    fn test_api_key_is_redacted_in_debug() {
        let config = EngineConfig::new("https://api.example.com", "super-secret".into());
        let debug = format!("{config:?}");
        assert!(!debug.contains("super-secret"));
    }
}
