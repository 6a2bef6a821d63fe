//! Connection, publisher and subscriber configuration types.

use std::collections::BTreeSet;
use std::time::Duration;

use serde::Deserialize;

use crate::bus::{BusError, Result};

/// Default broker URL.
pub const DEFAULT_URL: &str = "nats://localhost:4222";
/// Default client name reported to the broker.
pub const DEFAULT_CLIENT_NAME: &str = "ackbus";
/// Default fixed delay between reconnect attempts.
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 1_000;
/// Default total reconnect budget (10 minutes).
pub const DEFAULT_RECONNECT_TOTAL_WAIT_SECS: u64 = 600;
/// Default bound on the initial dial.
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 2_000;
/// Default wait for a subscriber's ack.
pub const DEFAULT_ACK_WAIT_TIMEOUT_MS: u64 = 30_000;
/// Default graceful drain window for `close`.
pub const DEFAULT_CLOSE_TIMEOUT_MS: u64 = 30_000;
/// Default capacity of a subscription's output channel.
pub const DEFAULT_OUTPUT_BUFFER: usize = 1024;

/// Transport type discriminator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportType {
    /// NATS core.
    #[default]
    Nats,
    /// In-process broker (no external dependency).
    Memory,
}

/// Broker connection configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Broker URL.
    pub url: String,
    /// Client name of the shared default connection.
    pub client_name: String,
    /// Fixed delay between reconnect attempts, in milliseconds.
    pub reconnect_delay_ms: u64,
    /// Total time to keep reconnecting before giving up, in seconds.
    pub reconnect_total_wait_secs: u64,
    /// Bound on the initial dial, in milliseconds.
    pub connect_timeout_ms: u64,
    /// Share one connection between every component of the process.
    pub use_default_connection: bool,
}

impl ConnectionConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn reconnect_total_wait(&self) -> Duration {
        Duration::from_secs(self.reconnect_total_wait_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_URL.to_string(),
            client_name: DEFAULT_CLIENT_NAME.to_string(),
            reconnect_delay_ms: DEFAULT_RECONNECT_DELAY_MS,
            reconnect_total_wait_secs: DEFAULT_RECONNECT_TOTAL_WAIT_SECS,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            use_default_connection: true,
        }
    }
}

/// Publisher configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PublisherConfig {
    /// Topics published fire-and-forget (no ack round trip).
    pub no_ack_topics: BTreeSet<String>,
    /// How long to wait for a subscriber's ack, in milliseconds.
    pub ack_wait_timeout_ms: u64,
}

impl PublisherConfig {
    pub fn ack_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_wait_timeout_ms)
    }

    /// Builder-style: mark `topic` as fire-and-forget.
    pub fn with_no_ack_topic(mut self, topic: impl Into<String>) -> Self {
        self.no_ack_topics.insert(topic.into());
        self
    }

    /// Builder-style: set the ack wait timeout.
    pub fn with_ack_wait_timeout(mut self, timeout: Duration) -> Self {
        self.ack_wait_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn is_no_ack(&self, topic: &str) -> bool {
        self.no_ack_topics.contains(topic)
    }
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            no_ack_topics: BTreeSet::new(),
            ack_wait_timeout_ms: DEFAULT_ACK_WAIT_TIMEOUT_MS,
        }
    }
}

/// Subscriber configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SubscriberConfig {
    /// Queue group shared by load-balanced consumers. Empty means broadcast.
    pub queue_group: Option<String>,
    /// Number of concurrent consume loops per subscription.
    pub subscribers_count: usize,
    /// How long `close` waits for in-flight messages, in milliseconds.
    pub close_timeout_ms: u64,
    /// Capacity of each subscription's output channel.
    pub output_buffer: usize,
}

impl SubscriberConfig {
    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    /// Queue group, treating an empty name as none.
    pub fn queue_group(&self) -> Option<&str> {
        self.queue_group.as_deref().filter(|g| !g.is_empty())
    }

    /// Builder-style: set the queue group.
    pub fn with_queue_group(mut self, group: impl Into<String>) -> Self {
        self.queue_group = Some(group.into());
        self
    }

    /// Builder-style: set the number of workers.
    pub fn with_subscribers_count(mut self, count: usize) -> Self {
        self.subscribers_count = count;
        self
    }

    /// Builder-style: set the close timeout.
    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Reject configurations that would duplicate or drop deliveries.
    pub fn validate(&self) -> Result<()> {
        if self.subscribers_count == 0 {
            return Err(BusError::InvalidConfig(
                "subscribers_count must be at least 1".to_string(),
            ));
        }
        if self.subscribers_count > 1 && self.queue_group().is_none() {
            return Err(BusError::InvalidConfig(format!(
                "subscribers_count is {} but queue_group is empty; every worker would receive every message",
                self.subscribers_count
            )));
        }
        if self.output_buffer == 0 {
            return Err(BusError::InvalidConfig(
                "output_buffer must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            queue_group: None,
            subscribers_count: 1,
            close_timeout_ms: DEFAULT_CLOSE_TIMEOUT_MS,
            output_buffer: DEFAULT_OUTPUT_BUFFER,
        }
    }
}
