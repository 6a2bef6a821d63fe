//! Publisher with per-topic acknowledgment policy.
//!
//! Topics listed in `no_ack_topics` are published fire-and-forget. Every
//! other topic is sent as a request and the call waits for the subscriber's
//! reply: `"OK"` means success, anything else is a rejection.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::codec::{HeaderMarshaler, Marshaler};
use super::connection::{Connection, ConnectionFactory};
use super::message::Message;
use super::{BusError, Publisher, Result, ACK_REPLY};
use crate::config::PublisherConfig;

/// Publisher built on request/reply acknowledgments.
pub struct AckPublisher {
    config: PublisherConfig,
    connection: Connection,
    owns_connection: bool,
    marshaler: Arc<dyn Marshaler>,
    closed: AtomicBool,
}

impl AckPublisher {
    /// Create a publisher on an existing connection.
    ///
    /// The connection is not closed by `close`; use [`AckPublisher::connect`]
    /// for a publisher that owns its connection.
    pub fn new(config: PublisherConfig, connection: Connection) -> Self {
        Self {
            config,
            connection,
            owns_connection: false,
            marshaler: Arc::new(HeaderMarshaler),
            closed: AtomicBool::new(false),
        }
    }

    /// Create a publisher whose connection comes from `factory`.
    pub async fn connect(
        factory: &ConnectionFactory,
        name: &str,
        config: PublisherConfig,
    ) -> Result<Self> {
        let (connection, owned) = factory.connection_for(name).await?;
        let mut publisher = Self::new(config, connection);
        publisher.owns_connection = owned;
        Ok(publisher)
    }

    /// Replace the wire codec.
    pub fn with_marshaler(mut self, marshaler: Arc<dyn Marshaler>) -> Self {
        self.marshaler = marshaler;
        self
    }

    pub fn config(&self) -> &PublisherConfig {
        &self.config
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn publish_one(&self, topic: &str, message: &Message) -> Result<()> {
        let raw = self.marshaler.marshal(topic, message)?;

        if self.config.is_no_ack(topic) {
            self.connection.publish(raw).await?;
            debug!(topic = %topic, uuid = %message.uuid, "Published without ack");
            return Ok(());
        }

        let timeout = self.config.ack_wait_timeout();
        let reply = self.connection.request(raw, timeout).await?;
        let reply = reply.payload_str();
        if reply != ACK_REPLY {
            warn!(topic = %topic, uuid = %message.uuid, reply = %reply, "Message rejected");
            return Err(BusError::Rejected {
                topic: topic.to_string(),
                reply,
            });
        }

        debug!(topic = %topic, uuid = %message.uuid, "Published and acked");
        Ok(())
    }
}

#[async_trait]
impl Publisher for AckPublisher {
    #[tracing::instrument(name = "bus.publish", skip_all, fields(topic = %topic, count = messages.len()))]
    async fn publish(&self, topic: &str, messages: Vec<Message>) -> Result<()> {
        if self.is_closed() {
            return Err(BusError::Closed("publisher"));
        }
        for message in &messages {
            self.publish_one(topic, message).await?;
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if self.owns_connection {
            self.connection.close().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests;
