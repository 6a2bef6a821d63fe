//! Broker transports.
//!
//! The bus core talks to the broker only through the `Transport` trait:
//! publish, request-with-timeout, (queue) subscribe, respond and close.
//! Connection establishment goes through a `Connector`.
//!
//! Implementations:
//! - `memory`: in-process broker, always available
//! - `nats`: NATS core via `async-nats` (feature `nats`)

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use super::connection::{ConnectionObserver, ReconnectPolicy};
use super::Result;

pub mod memory;
#[cfg(feature = "nats")]
pub mod nats;

pub use memory::{MemoryBroker, MemoryConnector};
#[cfg(feature = "nats")]
pub use nats::NatsConnector;

/// Wire-level message as exchanged with the broker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawMessage {
    /// Subject (topic) the message was published on.
    pub subject: String,
    /// Reply subject, present when the publisher waits for an answer.
    pub reply: Option<String>,
    /// Broker headers.
    pub headers: BTreeMap<String, String>,
    /// Message body.
    pub payload: Bytes,
}

impl RawMessage {
    pub fn new(subject: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            subject: subject.into(),
            payload: payload.into(),
            ..Default::default()
        }
    }

    /// Body interpreted as UTF-8, lossy.
    pub fn payload_str(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

/// Options applied when opening a broker connection.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Client name reported to the broker.
    pub name: String,
    /// Policy for post-connect drops.
    pub reconnect: ReconnectPolicy,
    /// Bound on the initial dial.
    pub connect_timeout: Duration,
}

/// Broker connection primitives.
///
/// Implementations must be safe for concurrent use from many publishers and
/// subscribers.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Publish without waiting for any answer.
    async fn publish(&self, message: RawMessage) -> Result<()>;

    /// Publish and wait up to `timeout` for a single reply.
    ///
    /// Returns `BusError::AckTimeout` when nobody answers in time.
    async fn request(&self, message: RawMessage, timeout: Duration) -> Result<RawMessage>;

    /// Subscribe to `subject`, within `queue_group` when given.
    async fn subscribe(
        &self,
        subject: &str,
        queue_group: Option<&str>,
    ) -> Result<Box<dyn TransportSubscription>>;

    /// Answer a request on its reply subject.
    async fn respond(&self, reply: &str, payload: Bytes) -> Result<()>;

    /// Wait until everything published so far reached the broker.
    async fn flush(&self) -> Result<()>;

    /// Close the connection. Idempotent.
    async fn close(&self) -> Result<()>;

    fn is_closed(&self) -> bool;

    /// Client name the connection was opened with.
    fn name(&self) -> &str;
}

/// A live broker-level subscription.
#[async_trait]
pub trait TransportSubscription: Send {
    /// Next delivered message, `None` once the subscription ended.
    async fn next(&mut self) -> Option<RawMessage>;

    /// Stop delivery. Idempotent.
    async fn unsubscribe(&mut self) -> Result<()>;
}

/// Opens broker connections.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        options: &ConnectOptions,
        observer: Arc<dyn ConnectionObserver>,
    ) -> Result<Arc<dyn Transport>>;
}
