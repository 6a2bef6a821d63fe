//! Connection factory.
//!
//! Produces broker connections with a uniform naming and reconnect policy and
//! owns the shared default connection. The factory is an ordinary value:
//! create one per process (or per test) and pass it to publishers,
//! subscribers and senders.

use std::sync::Arc;
use std::time::Duration;

use backon::ConstantBuilder;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::transport::{ConnectOptions, Connector, Transport};
use super::{BusError, Result};
use crate::config::ConnectionConfig;

/// Shared handle to a broker connection.
pub type Connection = Arc<dyn Transport>;

// ============================================================================
// Reconnect policy
// ============================================================================

/// Fixed-delay reconnect policy bounded by a total wait budget.
///
/// `max_attempts = total_wait / delay`, so the connection keeps retrying for
/// roughly `total_wait` and then gives up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub delay: Duration,
    pub total_wait: Duration,
}

impl ReconnectPolicy {
    pub fn new(delay: Duration, total_wait: Duration) -> Self {
        Self { delay, total_wait }
    }

    /// Number of reconnect attempts before the connection is closed for good.
    pub fn max_attempts(&self) -> usize {
        let delay = self.delay.as_millis();
        if delay == 0 {
            return 1;
        }
        (self.total_wait.as_millis() / delay).max(1) as usize
    }

    /// Delays between reconnect attempts.
    pub fn backoff(&self) -> ConstantBuilder {
        ConstantBuilder::default()
            .with_delay(self.delay)
            .with_max_times(self.max_attempts())
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(1),
            total_wait: Duration::from_secs(10 * 60),
        }
    }
}

// ============================================================================
// Observer
// ============================================================================

/// Connection lifecycle transitions surfaced by transports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Connection dropped while not explicitly closed.
    Disconnected { name: String, error: Option<String> },
    /// Connection re-established after a drop.
    Reconnected { name: String, url: String },
    /// Connection closed for good (explicitly or reconnect budget exhausted).
    Closed { name: String },
}

/// Receives connection lifecycle events.
pub trait ConnectionObserver: Send + Sync {
    fn on_event(&self, event: ConnectionEvent);
}

/// Observer that logs every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingObserver;

impl ConnectionObserver for LoggingObserver {
    fn on_event(&self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Disconnected { name, error } => match error {
                Some(error) => error!(connection = %name, error = %error, "Broker disconnected"),
                None => warn!(connection = %name, "Broker disconnected"),
            },
            ConnectionEvent::Reconnected { name, url } => {
                info!(connection = %name, url = %url, "Broker reconnected")
            }
            ConnectionEvent::Closed { name } => info!(connection = %name, "Broker connection closed"),
        }
    }
}

// ============================================================================
// Factory
// ============================================================================

/// Creates named connections and caches the default one.
pub struct ConnectionFactory {
    connector: Arc<dyn Connector>,
    config: ConnectionConfig,
    observer: Arc<dyn ConnectionObserver>,
    default: Mutex<Option<Connection>>,
}

impl ConnectionFactory {
    /// Create a factory that logs connection events.
    pub fn new(connector: Arc<dyn Connector>, config: ConnectionConfig) -> Self {
        Self {
            connector,
            config,
            observer: Arc::new(LoggingObserver),
            default: Mutex::new(None),
        }
    }

    /// Replace the connection observer.
    pub fn with_observer(mut self, observer: Arc<dyn ConnectionObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Reconnect policy applied to every connection.
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy::new(self.config.reconnect_delay(), self.config.reconnect_total_wait())
    }

    /// Open a new connection tagged with `name`.
    ///
    /// The initial dial is not retried; only later drops are handled by the
    /// reconnect policy.
    pub async fn create(&self, name: &str) -> Result<Connection> {
        let options = ConnectOptions {
            name: name.to_string(),
            reconnect: self.reconnect_policy(),
            connect_timeout: self.config.connect_timeout(),
        };

        let connection = tokio::time::timeout(
            options.connect_timeout,
            self.connector.connect(&options, Arc::clone(&self.observer)),
        )
        .await
        .map_err(|_| {
            BusError::Connection(format!(
                "Timed out after {:?} connecting '{}'",
                options.connect_timeout, name
            ))
        })??;

        info!(
            connection = %name,
            max_reconnects = options.reconnect.max_attempts(),
            reconnect_delay_ms = %options.reconnect.delay.as_millis(),
            "Connected to broker"
        );

        Ok(connection)
    }

    /// Shared connection, created on first call.
    ///
    /// A cached connection that has been closed is replaced.
    pub async fn default_connection(&self) -> Result<Connection> {
        let mut guard = self.default.lock().await;
        if let Some(conn) = guard.as_ref() {
            if !conn.is_closed() {
                return Ok(Arc::clone(conn));
            }
            debug!("Default connection closed, reconnecting");
        }

        let conn = self.create(&self.config.client_name).await?;
        *guard = Some(Arc::clone(&conn));
        Ok(conn)
    }

    /// Connection for a component named `name`.
    ///
    /// Returns the shared default connection when `use_default_connection`
    /// is set, otherwise a dedicated one. The flag tells whether the caller
    /// owns (and must close) the connection.
    pub async fn connection_for(&self, name: &str) -> Result<(Connection, bool)> {
        if self.config.use_default_connection {
            Ok((self.default_connection().await?, false))
        } else {
            Ok((self.create(name).await?, true))
        }
    }

    /// Close and forget the default connection.
    pub async fn close_default(&self) -> Result<()> {
        let conn = self.default.lock().await.take();
        match conn {
            Some(conn) => conn.close().await,
            None => Ok(()),
        }
    }
}
