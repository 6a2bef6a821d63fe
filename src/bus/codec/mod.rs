//! Wire codecs.
//!
//! A `Marshaler` turns an application `Message` into the `RawMessage` sent to
//! the broker; an `Unmarshaler` does the reverse for received messages.
//!
//! Implementations:
//! - `HeaderMarshaler`: uuid and metadata as broker headers, payload as body.
//!   Metadata must fit the header line format; use `JsonMarshaler` for
//!   arbitrary keys and values.
//! - `JsonMarshaler`: the whole message as a JSON body, for brokers without
//!   header support

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::message::{Message, Metadata};
use super::transport::RawMessage;
use super::{BusError, Result};

/// Header carrying the message uuid.
pub const UUID_HEADER: &str = "Ackbus-Message-Uuid";

/// Prefix for headers that carry message metadata.
pub const METADATA_HEADER_PREFIX: &str = "Ackbus-Meta-";

/// Converts messages into their wire form.
pub trait Marshaler: Send + Sync {
    fn marshal(&self, topic: &str, message: &Message) -> Result<RawMessage>;
}

/// Rebuilds messages from their wire form.
pub trait Unmarshaler: Send + Sync {
    fn unmarshal(&self, raw: &RawMessage) -> Result<Message>;
}

/// Both directions of a codec.
pub trait Codec: Marshaler + Unmarshaler {}

impl<T: Marshaler + Unmarshaler> Codec for T {}

// ============================================================================
// Header codec
// ============================================================================

/// Stores uuid and metadata in broker headers and the payload as body.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeaderMarshaler;

impl Marshaler for HeaderMarshaler {
    fn marshal(&self, topic: &str, message: &Message) -> Result<RawMessage> {
        if message.uuid.is_empty() {
            return Err(BusError::Marshal("message uuid is empty".to_string()));
        }
        check_header_value("message uuid", &message.uuid)?;

        let mut headers = BTreeMap::new();
        headers.insert(UUID_HEADER.to_string(), message.uuid.clone());
        for (key, value) in &message.metadata {
            check_header_key(key)?;
            check_header_value(key, value)?;
            headers.insert(format!("{}{}", METADATA_HEADER_PREFIX, key), value.clone());
        }

        Ok(RawMessage {
            subject: topic.to_string(),
            reply: None,
            headers,
            payload: message.payload.clone(),
        })
    }
}

/// Header names are a single token of visible ASCII without `:`.
fn check_header_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(BusError::Marshal("metadata key is empty".to_string()));
    }
    if !key.bytes().all(|b| b.is_ascii_graphic() && b != b':') {
        return Err(BusError::Marshal(format!(
            "metadata key {:?} is not a valid header name",
            key
        )));
    }
    Ok(())
}

/// Header values are line-based and whitespace-trimmed on the wire.
fn check_header_value(name: &str, value: &str) -> Result<()> {
    if value.chars().any(char::is_control) {
        return Err(BusError::Marshal(format!(
            "{} contains control characters",
            name
        )));
    }
    if value.trim() != value {
        return Err(BusError::Marshal(format!(
            "{} has leading or trailing whitespace",
            name
        )));
    }
    Ok(())
}

impl Unmarshaler for HeaderMarshaler {
    fn unmarshal(&self, raw: &RawMessage) -> Result<Message> {
        let uuid = raw
            .headers
            .get(UUID_HEADER)
            .filter(|u| !u.is_empty())
            .ok_or_else(|| BusError::Unmarshal(format!("missing {} header", UUID_HEADER)))?;

        let metadata: Metadata = raw
            .headers
            .iter()
            .filter_map(|(name, value)| {
                name.strip_prefix(METADATA_HEADER_PREFIX)
                    .map(|key| (key.to_string(), value.clone()))
            })
            .collect();

        let mut message = Message::with_uuid(uuid.clone(), raw.payload.clone());
        message.metadata = metadata;
        Ok(message)
    }
}

// ============================================================================
// JSON codec
// ============================================================================

#[derive(Serialize, Deserialize)]
struct Envelope {
    uuid: String,
    #[serde(default)]
    metadata: Metadata,
    payload: Vec<u8>,
}

/// Encodes the whole message as a JSON envelope in the body.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonMarshaler;

impl Marshaler for JsonMarshaler {
    fn marshal(&self, topic: &str, message: &Message) -> Result<RawMessage> {
        let envelope = Envelope {
            uuid: message.uuid.clone(),
            metadata: message.metadata.clone(),
            payload: message.payload.to_vec(),
        };
        let body = serde_json::to_vec(&envelope).map_err(|e| BusError::Marshal(e.to_string()))?;
        Ok(RawMessage::new(topic, Bytes::from(body)))
    }
}

impl Unmarshaler for JsonMarshaler {
    fn unmarshal(&self, raw: &RawMessage) -> Result<Message> {
        let envelope: Envelope = serde_json::from_slice(&raw.payload)
            .map_err(|e| BusError::Unmarshal(format!("invalid envelope: {}", e)))?;
        let mut message = Message::with_uuid(envelope.uuid, envelope.payload);
        message.metadata = envelope.metadata;
        Ok(message)
    }
}
