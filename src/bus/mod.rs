//! Message bus client layer.
//!
//! This module contains:
//! - `Publisher` / `Subscriber` / `Sender` traits: the surface the rest of the
//!   application consumes
//! - `BusError`: the error taxonomy for every bus operation
//! - Implementations: `AckPublisher`, `AckSubscriber`, `LazySender`
//! - Transports: NATS (feature `nats`) and an in-memory broker

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use serde::Serialize;
use tokio::sync::mpsc;

pub mod codec;
pub mod connection;
pub mod context;
pub mod message;
pub mod publisher;
pub mod sender;
pub mod subscriber;
pub mod transport;

// Re-exports
pub use codec::{HeaderMarshaler, JsonMarshaler, Marshaler, Unmarshaler};
pub use connection::{
    Connection, ConnectionEvent, ConnectionFactory, ConnectionObserver, LoggingObserver,
    ReconnectPolicy,
};
pub use context::Context;
pub use message::{AckDecision, Message, Metadata};
pub use publisher::AckPublisher;
pub use sender::{LazySender, SenderState};
pub use subscriber::AckSubscriber;

/// Reply payload a consumer sends back for an acknowledged message.
pub const ACK_REPLY: &str = "OK";

/// Reply payload a consumer sends back for a negatively acknowledged message.
pub const NACK_REPLY: &str = "Nacked";

/// Prefix of the reply sent for messages that could not be decoded.
pub const UNMARSHAL_REPLY: &str = "cannot unmarshal";

// ============================================================================
// Errors
// ============================================================================

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    #[error("No acknowledgment for topic '{topic}' within {timeout:?}")]
    AckTimeout { topic: String, timeout: Duration },

    #[error("Message on topic '{topic}' rejected: {reply}")]
    Rejected { topic: String, reply: String },

    #[error("Cannot marshal message: {0}")]
    Marshal(String),

    #[error("Cannot unmarshal message: {0}")]
    Unmarshal(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Not connected yet")]
    NotConnected,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("{0} is closed")]
    Closed(&'static str),
}

impl BusError {
    /// Whether the error means the message may simply be retried later.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BusError::NotConnected | BusError::AckTimeout { .. } | BusError::Publish(_)
        )
    }
}

// ============================================================================
// Traits
// ============================================================================

/// Publishes messages on a topic.
///
/// Implementations:
/// - `AckPublisher`: waits for the subscriber's reply unless the topic is
///   configured as fire-and-forget
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publish messages in order.
    ///
    /// The first failing message aborts the call. Messages before it have
    /// already been sent.
    async fn publish(&self, topic: &str, messages: Vec<Message>) -> Result<()>;

    /// Release the connection. Later publishes fail with `BusError::Closed`.
    async fn close(&self) -> Result<()>;
}

/// Consumes messages from a topic.
///
/// Implementations:
/// - `AckSubscriber`: concurrent workers, optional queue group, reply-based
///   ack/nack
#[async_trait]
pub trait Subscriber: Send + Sync {
    /// Start consuming `topic`.
    ///
    /// Every received message must be acked or nacked by the consumer.
    /// Cancelling `ctx` stops the subscription and closes the channel.
    async fn subscribe(&self, ctx: &Context, topic: &str) -> Result<mpsc::Receiver<Message>>;

    /// Stop every subscription and release the connection.
    async fn close(&self) -> Result<()>;
}

/// Fire-and-forget producer that never blocks on connection setup.
#[async_trait]
pub trait Sender: Send + Sync {
    /// Send an encoded `payload` on `topic`, tagged with `source`.
    async fn send(&self, ctx: &Context, topic: &str, source: &str, payload: Bytes) -> Result<()>;
}

/// Typed helpers for every `Sender`, including `dyn Sender`.
pub trait SenderExt: Sender {
    /// Encode `payload` as JSON and send it.
    fn send_json<'a, T>(
        &'a self,
        ctx: &'a Context,
        topic: &'a str,
        source: &'a str,
        payload: &T,
    ) -> BoxFuture<'a, Result<()>>
    where
        T: Serialize + ?Sized,
    {
        let encoded = serde_json::to_vec(payload)
            .map(Bytes::from)
            .map_err(|e| BusError::Marshal(e.to_string()));
        Box::pin(async move { self.send(ctx, topic, source, encoded?).await })
    }
}

impl<S: Sender + ?Sized> SenderExt for S {}
