//! Application configuration.
//!
//! Aggregates configuration from all modules into a single Config struct
//! that can be loaded from YAML files or environment variables.

use std::time::Duration;

use serde::Deserialize;

use crate::ajam::AjamConfig;
use crate::ami::relay::AmiConfig;
use crate::api::RestApiConfig;
use crate::bus::consumer::DEFAULT_HANDLER_TIMEOUT;
use crate::bus::BusConfig;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "AMI_GATEWAY_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "AMI_GATEWAY";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "AMI_GATEWAY_LOG";

/// Exchange types the broker accepts.
const EXCHANGE_TYPES: &[&str] = &["headers", "topic", "direct", "fanout"];

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Bus consumer settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Queue to bind. Empty means an exclusive, server-named queue.
    pub queue_name: String,
    pub handler_timeout_secs: u64,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            queue_name: String::new(),
            handler_timeout_secs: DEFAULT_HANDLER_TIMEOUT.as_secs(),
        }
    }
}

impl ConsumerConfig {
    pub fn handler_timeout(&self) -> Duration {
        Duration::from_secs(self.handler_timeout_secs)
    }
}

/// Main application configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Identity stamped on every published event as `origin_uuid`.
    pub uuid: String,
    /// Relay AMI events onto the bus.
    pub publish_ami_events: bool,
    pub ajam: AjamConfig,
    pub ami: AmiConfig,
    pub bus: BusConfig,
    pub rest_api: RestApiConfig,
    pub consumer: ConsumerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            uuid: uuid::Uuid::new_v4().to_string(),
            publish_ami_events: true,
            ajam: AjamConfig::default(),
            ami: AmiConfig::default(),
            bus: BusConfig::default(),
            rest_api: RestApiConfig::default(),
            consumer: ConsumerConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `config.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config: Config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would only fail later at runtime.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.uuid.trim().is_empty() {
            return Err(ConfigError::Invalid("uuid must not be empty".to_string()));
        }
        if self.ajam.timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "ajam.timeout_ms must be greater than zero".to_string(),
            ));
        }
        if !EXCHANGE_TYPES.contains(&self.bus.exchange_type.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "bus.exchange_type '{}' is not one of {:?}",
                self.bus.exchange_type, EXCHANGE_TYPES
            )));
        }
        if self.consumer.handler_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "consumer.handler_timeout_secs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Whether the AMI relay should run.
    pub fn relay_enabled(&self) -> bool {
        self.ami.enabled && self.publish_ami_events
    }
}

#[cfg(test)]
mod tests;
