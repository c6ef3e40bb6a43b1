//! Configuration for producers and workers
//!
//! Read from environment variables, with the legacy `REDIS_URL` and
//! `WORKER_CONCURRENCY` names honoured as fallbacks.

use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::manager::DEFAULT_QUEUE_NAME;
use crate::worker::WorkerConfig;

/// Error types for configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Default store when nothing is configured
pub const DEFAULT_STORE_URL: &str = "sqlite:tally.db?mode=rwc";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Store URL (env: TALLY_STORE_URL, then REDIS_URL)
    pub store_url: String,
    /// Queue name (env: TALLY_QUEUE)
    pub queue_name: String,
    /// Worker concurrency (env: TALLY_CONCURRENCY, then WORKER_CONCURRENCY)
    pub concurrency: usize,
    /// env: TALLY_POLL_INTERVAL_MS
    pub poll_interval_ms: u64,
    /// env: TALLY_BUSY_INTERVAL_MS
    pub busy_interval_ms: u64,
    /// env: TALLY_ERROR_BACKOFF_MS
    pub error_backoff_ms: u64,
    /// env: TALLY_DRAIN_INTERVAL_MS
    pub drain_interval_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            store_url: DEFAULT_STORE_URL.to_string(),
            queue_name: DEFAULT_QUEUE_NAME.to_string(),
            concurrency: 5,
            poll_interval_ms: 1000,
            busy_interval_ms: 100,
            error_backoff_ms: 5000,
            drain_interval_ms: 1000,
        }
    }
}

impl QueueConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let first = |keys: &[&str]| keys.iter().find_map(|key| lookup(*key));

        let concurrency = parse_or(
            first(&["TALLY_CONCURRENCY", "WORKER_CONCURRENCY"]),
            "TALLY_CONCURRENCY",
            defaults.concurrency,
        )?;
        if concurrency == 0 {
            return Err(ConfigError::Invalid(
                "TALLY_CONCURRENCY must be at least 1".into(),
            ));
        }

        Ok(Self {
            store_url: first(&["TALLY_STORE_URL", "REDIS_URL"]).unwrap_or(defaults.store_url),
            queue_name: lookup("TALLY_QUEUE").unwrap_or(defaults.queue_name),
            concurrency,
            poll_interval_ms: parse_or(
                lookup("TALLY_POLL_INTERVAL_MS"),
                "TALLY_POLL_INTERVAL_MS",
                defaults.poll_interval_ms,
            )?,
            busy_interval_ms: parse_or(
                lookup("TALLY_BUSY_INTERVAL_MS"),
                "TALLY_BUSY_INTERVAL_MS",
                defaults.busy_interval_ms,
            )?,
            error_backoff_ms: parse_or(
                lookup("TALLY_ERROR_BACKOFF_MS"),
                "TALLY_ERROR_BACKOFF_MS",
                defaults.error_backoff_ms,
            )?,
            drain_interval_ms: parse_or(
                lookup("TALLY_DRAIN_INTERVAL_MS"),
                "TALLY_DRAIN_INTERVAL_MS",
                defaults.drain_interval_ms,
            )?,
        })
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig::default()
            .with_concurrency(self.concurrency)
            .with_poll_interval(Duration::from_millis(self.poll_interval_ms))
            .with_busy_interval(Duration::from_millis(self.busy_interval_ms))
            .with_error_backoff(Duration::from_millis(self.error_backoff_ms))
            .with_drain_interval(Duration::from_millis(self.drain_interval_ms))
    }
}

fn parse_or<T: FromStr>(raw: Option<String>, key: &str, default: T) -> Result<T, ConfigError> {
    match raw {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("{} is not a valid number: {:?}", key, raw))),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = QueueConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, QueueConfig::default());
        assert_eq!(config.queue_name, "whatsapp-surveys");
        assert_eq!(config.worker_config(), WorkerConfig::default());
    }

    #[test]
    fn test_legacy_fallbacks() {
        let config = QueueConfig::from_lookup(lookup(&[
            ("REDIS_URL", "redis://cache:6379"),
            ("WORKER_CONCURRENCY", "8"),
        ]))
        .unwrap();
        assert_eq!(config.store_url, "redis://cache:6379");
        assert_eq!(config.concurrency, 8);

        let config = QueueConfig::from_lookup(lookup(&[
            ("TALLY_STORE_URL", "memory"),
            ("REDIS_URL", "redis://cache:6379"),
        ]))
        .unwrap();
        assert_eq!(config.store_url, "memory");
    }

    #[test]
    fn test_worker_config_from_env_values() {
        let config = QueueConfig::from_lookup(lookup(&[
            ("TALLY_CONCURRENCY", "2"),
            ("TALLY_POLL_INTERVAL_MS", "250"),
        ]))
        .unwrap();
        let worker = config.worker_config();
        assert_eq!(worker.concurrency, 2);
        assert_eq!(worker.poll_interval, Duration::from_millis(250));
    }

    #[test]
    fn test_invalid_numbers() {
        assert!(matches!(
            QueueConfig::from_lookup(lookup(&[("TALLY_BUSY_INTERVAL_MS", "soon")])),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            QueueConfig::from_lookup(lookup(&[("TALLY_CONCURRENCY", "0")])),
            Err(ConfigError::Invalid(_))
        ));
    }
}
