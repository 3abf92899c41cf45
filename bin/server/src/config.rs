//! Centralized server configuration.
//!
//! Loaded via the `config` crate from environment variables, with `__`
//! separating nested keys (`NATS__URL`, `ENGINE__WORKER_CONCURRENCY`,
//! `ENGINE__ACTION_TIMEOUTS_SECS__SEND_EMAIL`).

use autorule_workflow::EngineConfig;
use autorule_workflow::nats::NatsConfig;
use serde::Deserialize;

/// Server configuration composed from library configs.
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address the HTTP server listens on.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// NATS connection. Without it the journal and outbox stay in memory.
    #[serde(default)]
    pub nats: Option<NatsConfig>,

    /// JSON file of rule definitions loaded at startup.
    #[serde(default)]
    pub rules_path: Option<String>,

    #[serde(default)]
    pub engine: EngineConfig,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

impl ServerConfig {
    /// Loads configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    pub fn from_env() -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(
                config::Environment::default()
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }
}
