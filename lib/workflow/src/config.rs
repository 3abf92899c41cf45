//! Engine configuration.
//!
//! Deserialized as part of the server configuration; every field has a
//! default so an empty section is valid.

use crate::catalog::ActionTypeInfo;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

/// Tuning for the execution engine.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Upper bound on node invocations running at the same time.
    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,

    /// Backoff for transient handler failures.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Per action type timeout overrides for asynchronous nodes, in seconds.
    #[serde(default)]
    pub action_timeouts_secs: HashMap<String, u64>,
}

fn default_worker_concurrency() -> usize {
    16
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_concurrency: default_worker_concurrency(),
            retry: RetryConfig::default(),
            action_timeouts_secs: HashMap::new(),
        }
    }
}

impl EngineConfig {
    /// Returns how long an asynchronous node of this type may wait.
    ///
    /// An override wins over the catalog default.
    #[must_use]
    pub fn timeout_for(&self, info: &ActionTypeInfo) -> Option<Duration> {
        self.action_timeouts_secs
            .get(&info.action_type)
            .map(|secs| Duration::from_secs(*secs))
            .or_else(|| info.default_timeout())
    }
}

/// Retry settings for transient failures.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RetryConfig {
    /// Attempts including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

fn default_multiplier() -> f64 {
    2.0
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            multiplier: default_multiplier(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Catalog;

    #[test]
    fn defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.worker_concurrency, 16);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.initial_backoff_ms, 500);
        assert_eq!(config.retry.max_backoff_ms, 30_000);
    }

    #[test]
    fn empty_section_deserializes_to_defaults() {
        let config: EngineConfig = serde_json::from_str("{}").expect("deserialize");
        assert_eq!(config.worker_concurrency, 16);
        assert_eq!(config.retry, RetryConfig::default());
    }

    #[test]
    fn timeout_override_wins() {
        let catalog = Catalog::embedded().expect("catalog");
        let email = catalog.action_type("send_email").expect("send_email");
        let mut config = EngineConfig::default();

        assert_eq!(config.timeout_for(email), Some(Duration::from_secs(120)));

        config
            .action_timeouts_secs
            .insert("send_email".to_string(), 5);
        assert_eq!(config.timeout_for(email), Some(Duration::from_secs(5)));

        let log = catalog.action_type("log_entry").expect("log_entry");
        assert_eq!(config.timeout_for(log), None);
    }
}
