//! Bootstrap utilities for ackbus binaries.

use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::bus::connection::ConnectionFactory;
use crate::bus::transport::{Connector, MemoryBroker};
use crate::bus::{BusError, Result};
use crate::config::{BusConfig, TransportType, LOG_ENV_VAR};

/// Initialize tracing with the ACKBUS_LOG environment variable.
///
/// Defaults to "info" level if ACKBUS_LOG is not set.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env(LOG_ENV_VAR)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Build the connector selected by `config.transport`.
pub fn connector(config: &BusConfig) -> Result<Arc<dyn Connector>> {
    match config.transport {
        TransportType::Memory => Ok(Arc::new(MemoryBroker::new().connector())),
        #[cfg(feature = "nats")]
        TransportType::Nats => Ok(Arc::new(crate::bus::transport::NatsConnector::new(
            config.connection.url.clone(),
        ))),
        #[cfg(not(feature = "nats"))]
        TransportType::Nats => Err(BusError::InvalidConfig(
            "nats transport requires the 'nats' feature".to_string(),
        )),
    }
}

/// Validate `config` and build a connection factory for it.
pub fn connection_factory(config: &BusConfig) -> Result<Arc<ConnectionFactory>> {
    config.validate()?;
    if config.connection.url.is_empty() && config.transport == TransportType::Nats {
        return Err(BusError::InvalidConfig(
            "connection.url must be set for the nats transport".to_string(),
        ));
    }
    let connector = connector(config)?;
    Ok(Arc::new(ConnectionFactory::new(
        connector,
        config.connection.clone(),
    )))
}
