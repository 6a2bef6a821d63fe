//! Lazy, non-blocking sender.
//!
//! For low-value periodic producers (liveness pings, status events) that
//! must never stall on a slow or failed broker. `send` never waits for a
//! connection: while none is available it kicks off a background connect
//! and fails fast with `BusError::NotConnected`, dropping that message.
//!
//! Connection state machine:
//!
//! ```text
//!            start_connect             connect ok
//!  Idle ─────────────────> Connecting ───────────> Connected
//!   ^                           │
//!   │                           │ connect failed
//!   └──── start_connect ─── Failed
//! ```
//!
//! Only the caller that moves the state into `Connecting` spawns the connect
//! attempt; every other caller observes its result.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::codec::{HeaderMarshaler, Marshaler};
use super::connection::{Connection, ConnectionFactory};
use super::context::Context;
use super::message::Message;
use super::{BusError, Result, Sender};

/// Metadata key carrying the producer name.
pub const SOURCE_METADATA_KEY: &str = "source";

/// Observable connection state of a `LazySender`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SenderState {
    Idle,
    Connecting,
    Connected,
    Failed(String),
}

enum ConnectState {
    Idle,
    Connecting,
    Connected { connection: Connection, owned: bool },
    Failed(String),
}

impl ConnectState {
    fn can_start(&self) -> bool {
        match self {
            ConnectState::Idle | ConnectState::Failed(_) => true,
            ConnectState::Connected { connection, .. } => connection.is_closed(),
            ConnectState::Connecting => false,
        }
    }
}

struct SenderInner {
    factory: Arc<ConnectionFactory>,
    name: String,
    state: watch::Sender<ConnectState>,
    closed: AtomicBool,
}

impl SenderInner {
    async fn connect(&self) {
        let next = match self.factory.connection_for(&self.name).await {
            Ok((connection, owned)) => ConnectState::Connected { connection, owned },
            Err(e) => {
                warn!(sender = %self.name, error = %e, "Sender connect failed");
                ConnectState::Failed(e.to_string())
            }
        };

        let connected = matches!(next, ConnectState::Connected { .. });

        // `close` flips `closed` before it resets the state, so checking the
        // flag under the state lock never publishes a result after close.
        let mut next = Some(next);
        self.state.send_if_modified(|state| {
            if self.closed.load(Ordering::SeqCst) {
                return false;
            }
            if let Some(next) = next.take() {
                *state = next;
            }
            true
        });

        match next {
            None if connected => info!(sender = %self.name, "Sender connected"),
            None => {}
            Some(ConnectState::Connected {
                connection,
                owned: true,
            }) => {
                debug!(sender = %self.name, "Sender closed while connecting, releasing connection");
                let _ = connection.close().await;
            }
            Some(_) => {}
        }
    }
}

/// Fire-and-forget sender that connects on first use.
#[derive(Clone)]
pub struct LazySender {
    inner: Arc<SenderInner>,
    marshaler: Arc<dyn Marshaler>,
}

impl LazySender {
    /// Create an idle sender. Nothing is dialed until `start_connect` or the
    /// first `send`.
    pub fn new(factory: Arc<ConnectionFactory>, name: impl Into<String>) -> Self {
        let (state, _) = watch::channel(ConnectState::Idle);
        Self {
            inner: Arc::new(SenderInner {
                factory,
                name: name.into(),
                state,
                closed: AtomicBool::new(false),
            }),
            marshaler: Arc::new(HeaderMarshaler),
        }
    }

    /// Replace the wire codec.
    pub fn with_marshaler(mut self, marshaler: Arc<dyn Marshaler>) -> Self {
        self.marshaler = marshaler;
        self
    }

    pub fn state(&self) -> SenderState {
        match &*self.inner.state.borrow() {
            ConnectState::Idle => SenderState::Idle,
            ConnectState::Connecting => SenderState::Connecting,
            ConnectState::Connected { .. } => SenderState::Connected,
            ConnectState::Failed(reason) => SenderState::Failed(reason.clone()),
        }
    }

    /// Start a background connect unless one is running or already done.
    ///
    /// Returns `true` if this call started the attempt.
    pub fn start_connect(&self) -> bool {
        if self.inner.closed.load(Ordering::SeqCst) {
            return false;
        }
        let started = self.inner.state.send_if_modified(|state| {
            if state.can_start() {
                *state = ConnectState::Connecting;
                true
            } else {
                false
            }
        });
        if started {
            debug!(sender = %self.inner.name, "Starting background connect");
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move { inner.connect().await });
        }
        started
    }

    /// Wait for the in-flight (or a fresh) connect attempt and report its
    /// outcome.
    pub async fn wait_connected(&self) -> Result<()> {
        self.start_connect();
        let mut rx = self.inner.state.subscribe();
        let state = rx
            .wait_for(|state| !matches!(state, ConnectState::Connecting))
            .await
            .map_err(|_| BusError::Closed("sender"))?;
        match &*state {
            ConnectState::Connected { .. } => Ok(()),
            ConnectState::Failed(reason) => Err(BusError::Connection(reason.clone())),
            ConnectState::Idle | ConnectState::Connecting => Err(BusError::NotConnected),
        }
    }

    /// Current connection, if connected and still open.
    fn connection(&self) -> Option<Connection> {
        match &*self.inner.state.borrow() {
            ConnectState::Connected { connection, .. } if !connection.is_closed() => {
                Some(Arc::clone(connection))
            }
            _ => None,
        }
    }

    /// Stop sending and release an owned connection. Idempotent.
    pub async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let previous = self.inner.state.send_replace(ConnectState::Idle);
        if let ConnectState::Connected {
            connection,
            owned: true,
        } = previous
        {
            connection.close().await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Sender for LazySender {
    async fn send(&self, ctx: &Context, topic: &str, source: &str, payload: Bytes) -> Result<()> {
        if ctx.is_cancelled() {
            return Err(BusError::Cancelled);
        }
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed("sender"));
        }

        let Some(connection) = self.connection() else {
            self.start_connect();
            return Err(BusError::NotConnected);
        };

        let message = Message::new(payload).with_metadata(SOURCE_METADATA_KEY, source);
        let raw = self.marshaler.marshal(topic, &message)?;
        connection.publish(raw).await?;
        debug!(topic = %topic, source = %source, uuid = %message.uuid, "Sent");
        Ok(())
    }
}

#[cfg(test)]
mod tests;
