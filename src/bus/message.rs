//! Application messages and their acknowledgment latch.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use serde::de::DeserializeOwned;
use tokio::sync::{oneshot, watch};

use super::context::Context;
use super::{BusError, Result};

/// Message metadata, ordered by key.
pub type Metadata = BTreeMap<String, String>;

/// Consumer decision for a delivered message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckDecision {
    Ack,
    Nack,
}

/// Single-fire acknowledgment latch shared by every clone of a message.
struct AckLatch {
    decision: watch::Sender<Option<AckDecision>>,
    notify: Mutex<Option<oneshot::Sender<AckDecision>>>,
}

impl AckLatch {
    fn new() -> Self {
        let (decision, _) = watch::channel(None);
        Self {
            decision,
            notify: Mutex::new(None),
        }
    }

    fn fire(&self, decision: AckDecision) -> bool {
        let fired = self.decision.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(decision);
            true
        });
        if fired {
            let waiter = match self.notify.lock() {
                Ok(mut guard) => guard.take(),
                Err(poisoned) => poisoned.into_inner().take(),
            };
            if let Some(waiter) = waiter {
                let _ = waiter.send(decision);
            }
        }
        fired
    }

    async fn wait_for(&self, wanted: AckDecision) -> bool {
        let mut rx = self.decision.subscribe();
        let matched = match rx.wait_for(|d| d.is_some()).await {
            Ok(d) => *d == Some(wanted),
            Err(_) => false,
        };
        matched
    }
}

/// A message travelling over the bus.
///
/// Payload is an opaque byte buffer; use [`Message::decode_json`] to turn it
/// into an application type. Clones share the same acknowledgment latch.
#[derive(Clone)]
pub struct Message {
    pub uuid: String,
    pub payload: Bytes,
    pub metadata: Metadata,
    ack: Arc<AckLatch>,
    context: Context,
}

impl Message {
    /// Create a message with a random v4 UUID.
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self::with_uuid(uuid::Uuid::new_v4().to_string(), payload)
    }

    /// Create a message with a caller-chosen id.
    pub fn with_uuid(uuid: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            uuid: uuid.into(),
            payload: payload.into(),
            metadata: Metadata::new(),
            ack: Arc::new(AckLatch::new()),
            context: Context::background(),
        }
    }

    /// Serialize `value` as JSON into a new message.
    pub fn from_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<Self> {
        let payload = serde_json::to_vec(value).map_err(|e| BusError::Marshal(e.to_string()))?;
        Ok(Self::new(payload))
    }

    /// Builder-style metadata insertion.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Decode the payload as JSON.
    pub fn decode_json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.payload).map_err(|e| BusError::Unmarshal(e.to_string()))
    }

    /// Context scoped to this delivery.
    ///
    /// Cancelled when the subscription stops or the delivery is finished.
    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Acknowledge the message. Returns `false` if a decision was already taken.
    pub fn ack(&self) -> bool {
        self.ack.fire(AckDecision::Ack)
    }

    /// Negatively acknowledge the message. Returns `false` if a decision was
    /// already taken.
    pub fn nack(&self) -> bool {
        self.ack.fire(AckDecision::Nack)
    }

    /// Decision taken so far, if any.
    pub fn decision(&self) -> Option<AckDecision> {
        *self.ack.decision.borrow()
    }

    /// Resolves to `true` once the message is acked, `false` if it was nacked.
    pub async fn acked(&self) -> bool {
        self.ack.wait_for(AckDecision::Ack).await
    }

    /// Resolves to `true` once the message is nacked, `false` if it was acked.
    pub async fn nacked(&self) -> bool {
        self.ack.wait_for(AckDecision::Nack).await
    }

    /// Fresh latch and context for a delivery, plus the receiving end of the
    /// decision.
    ///
    /// The receiver errors if every clone is dropped without a decision.
    pub(crate) fn into_delivery(
        mut self,
        context: Context,
    ) -> (Self, oneshot::Receiver<AckDecision>) {
        let mut latch = AckLatch::new();
        let (tx, rx) = oneshot::channel();
        *latch
            .notify
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(tx);
        self.ack = Arc::new(latch);
        self.context = context;
        (self, rx)
    }
}

impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        self.uuid == other.uuid && self.payload == other.payload && self.metadata == other.metadata
    }
}

impl Eq for Message {}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("uuid", &self.uuid)
            .field("payload_len", &self.payload.len())
            .field("metadata", &self.metadata)
            .field("decision", &self.decision())
            .finish()
    }
}
