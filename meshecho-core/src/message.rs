//! Message envelope: inbound and outbound messages, packing and message ids.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::delivery::DeliveryMethod;
use crate::destination::DestinationHash;

/// Opaque structured extras, keyed by field id. Never interpreted here.
pub type Fields = BTreeMap<u8, Vec<u8>>;

/// SHA-256 over destination, source and packed payload.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct MessageId([u8; 32]);

impl MessageId {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        MessageId(bytes)
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Payload {
    timestamp_ms: u64,
    title: Vec<u8>,
    content: Vec<u8>,
    fields: Fields,
}

/// Wire form of a message: addressing plus a bincode payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PackedEnvelope {
    destination: DestinationHash,
    source: DestinationHash,
    payload: Vec<u8>,
}

/// Decoded envelope as it travels between endpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub destination: DestinationHash,
    pub source: DestinationHash,
    pub timestamp_ms: u64,
    pub title: Vec<u8>,
    pub content: Vec<u8>,
    pub fields: Fields,
}

impl Envelope {
    /// Pack into bytes and compute the message id.
    pub fn pack(&self) -> Result<(Vec<u8>, MessageId), EnvelopeError> {
        let payload = bincode::serialize(&Payload {
            timestamp_ms: self.timestamp_ms,
            title: self.title.clone(),
            content: self.content.clone(),
            fields: self.fields.clone(),
        })?;
        let id = message_id(&self.destination, &self.source, &payload);
        let packed = bincode::serialize(&PackedEnvelope {
            destination: self.destination,
            source: self.source,
            payload,
        })?;
        Ok((packed, id))
    }

    pub fn unpack(bytes: &[u8]) -> Result<(Self, MessageId), EnvelopeError> {
        let packed: PackedEnvelope = bincode::deserialize(bytes)?;
        let id = message_id(&packed.destination, &packed.source, &packed.payload);
        let payload: Payload = bincode::deserialize(&packed.payload)?;
        Ok((
            Envelope {
                destination: packed.destination,
                source: packed.source,
                timestamp_ms: payload.timestamp_ms,
                title: payload.title,
                content: payload.content,
                fields: payload.fields,
            },
            id,
        ))
    }
}

fn message_id(destination: &DestinationHash, source: &DestinationHash, payload: &[u8]) -> MessageId {
    let mut hasher = Sha256::new();
    hasher.update(destination.as_bytes());
    hasher.update(source.as_bytes());
    hasher.update(payload);
    MessageId(hasher.finalize().into())
}

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("envelope codec error: {0}")]
    Codec(#[from] bincode::Error),
}

/// Link quality reported by the interface a message arrived on, when it has one.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SignalQuality {
    pub rssi: Option<f32>,
    pub snr: Option<f32>,
}

/// A message addressed to this endpoint. Read-only to the handler.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub id: MessageId,
    pub source: DestinationHash,
    pub destination: DestinationHash,
    pub title: Vec<u8>,
    pub content: Vec<u8>,
    pub fields: Fields,
    pub timestamp_ms: u64,
    pub received_at_ms: u64,
    pub method: DeliveryMethod,
    pub signal: Option<SignalQuality>,
}

impl InboundMessage {
    pub fn from_envelope(id: MessageId, envelope: Envelope, method: DeliveryMethod) -> Self {
        Self {
            id,
            source: envelope.source,
            destination: envelope.destination,
            title: envelope.title,
            content: envelope.content,
            fields: envelope.fields,
            timestamp_ms: envelope.timestamp_ms,
            received_at_ms: now_ms(),
            method,
            signal: None,
        }
    }

    pub fn content_as_string(&self) -> String {
        String::from_utf8_lossy(&self.content).into_owned()
    }

    pub fn title_as_string(&self) -> String {
        String::from_utf8_lossy(&self.title).into_owned()
    }
}

/// A message built by the handler and handed to delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub destination: DestinationHash,
    pub source: DestinationHash,
    pub title: Vec<u8>,
    pub content: Vec<u8>,
    pub fields: Fields,
    pub desired_method: DeliveryMethod,
}

impl OutboundMessage {
    /// Envelope stamped with the current time.
    pub fn envelope(&self) -> Envelope {
        Envelope {
            destination: self.destination,
            source: self.source,
            timestamp_ms: now_ms(),
            title: self.title.clone(),
            content: self.content.clone(),
            fields: self.fields.clone(),
        }
    }
}

/// Milliseconds since the unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
