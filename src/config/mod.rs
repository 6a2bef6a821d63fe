//! Application configuration.
//!
//! Aggregates connection, publisher and subscriber settings into a single
//! `BusConfig` that can be loaded from YAML files or environment variables.

mod messaging;

pub use messaging::{
    ConnectionConfig, PublisherConfig, SubscriberConfig, TransportType, DEFAULT_ACK_WAIT_TIMEOUT_MS,
    DEFAULT_CLIENT_NAME, DEFAULT_CLOSE_TIMEOUT_MS, DEFAULT_CONNECT_TIMEOUT_MS,
    DEFAULT_OUTPUT_BUFFER, DEFAULT_RECONNECT_DELAY_MS, DEFAULT_RECONNECT_TOTAL_WAIT_SECS,
    DEFAULT_URL,
};

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "ackbus.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "ACKBUS_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "ACKBUS";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "ACKBUS_LOG";

use serde::Deserialize;

use crate::bus::{BusError, Result};

/// Bus configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Which broker transport to use.
    pub transport: TransportType,
    /// Connection factory settings.
    pub connection: ConnectionConfig,
    /// Publisher settings.
    pub publisher: PublisherConfig,
    /// Subscriber settings.
    pub subscriber: SubscriberConfig,
}

impl BusConfig {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `ackbus.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    pub fn load(path: Option<&str>) -> std::result::Result<Self, Box<dyn std::error::Error>> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("publisher.no_ack_topics")
                    .try_parsing(true),
            )
            .build()?;

        let config: BusConfig = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a YAML document.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: BusConfig =
            serde_yaml::from_str(yaml).map_err(|e| BusError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field invariants.
    pub fn validate(&self) -> Result<()> {
        if self.connection.reconnect_delay_ms == 0 {
            return Err(BusError::InvalidConfig(
                "connection.reconnect_delay_ms must be positive".to_string(),
            ));
        }
        self.subscriber.validate()
    }

    /// Create config for testing: in-memory transport, short timeouts.
    pub fn for_test() -> Self {
        let mut config = Self {
            transport: TransportType::Memory,
            ..Self::default()
        };
        config.publisher.ack_wait_timeout_ms = 2_000;
        config.subscriber.close_timeout_ms = 2_000;
        config
    }
}
