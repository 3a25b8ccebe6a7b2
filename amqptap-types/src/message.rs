//! Tapped messages and their protocol envelope.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use thiserror::Error;

use crate::Headers;

/// AMQP delivery mode of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum DeliveryMode {
    /// Mode 1: not written to disk by the broker.
    Transient,
    /// Mode 2: survives a broker restart on durable queues.
    Persistent,
}

impl DeliveryMode {
    /// Map the raw protocol value. Unknown values yield `None`.
    pub fn from_raw(mode: u8) -> Option<Self> {
        match mode {
            1 => Some(DeliveryMode::Transient),
            2 => Some(DeliveryMode::Persistent),
            _ => None,
        }
    }

    /// The raw protocol value.
    pub fn as_raw(self) -> u8 {
        match self {
            DeliveryMode::Transient => 1,
            DeliveryMode::Persistent => 2,
        }
    }
}

/// Protocol-level metadata of a message, separate from its body.
///
/// Every property is optional on the wire; absent properties stay `None`.
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Envelope {
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub headers: Headers,
    pub delivery_mode: Option<DeliveryMode>,
    pub priority: Option<u8>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub expiration: Option<String>,
    pub message_id: Option<String>,
    /// Publisher supplied timestamp, seconds since the Unix epoch.
    pub timestamp: Option<u64>,
    /// The AMQP `type` property.
    pub kind: Option<String>,
    pub user_id: Option<String>,
    pub app_id: Option<String>,

    /// Set by the broker when the message was delivered before.
    #[cfg_attr(feature = "serde", serde(default))]
    pub redelivered: bool,
    /// Channel-scoped delivery tag assigned by the broker.
    #[cfg_attr(feature = "serde", serde(default))]
    pub delivery_tag: u64,
}

/// A tapped message is missing where it came from.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProvenanceError {
    #[error("tapped message has no source URI")]
    MissingSource,
    #[error("tapped message has no exchange (delivery tag {0})")]
    MissingExchange(u64),
}

/// A message observed on a tapped exchange.
///
/// Carries its full provenance (broker, exchange, routing key) and is never
/// modified after construction. The body is kept as received.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TapMessage {
    source_uri: String,
    exchange: String,
    routing_key: String,
    envelope: Envelope,
    body: Vec<u8>,
    received_at_ms: u64,
}

impl TapMessage {
    /// Build a message, stamping it with the current time.
    ///
    /// Fails when the source URI or exchange is empty: a tapped message
    /// always has a bound exchange, so an empty one means a broken delivery.
    pub fn new(
        source_uri: impl Into<String>,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        envelope: Envelope,
        body: Vec<u8>,
    ) -> Result<Self, ProvenanceError> {
        Self::with_timestamp(
            source_uri,
            exchange,
            routing_key,
            envelope,
            body,
            current_timestamp_ms(),
        )
    }

    /// Build a message with an explicit receive timestamp.
    pub fn with_timestamp(
        source_uri: impl Into<String>,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        envelope: Envelope,
        body: Vec<u8>,
        received_at_ms: u64,
    ) -> Result<Self, ProvenanceError> {
        let source_uri = source_uri.into();
        let exchange = exchange.into();

        if source_uri.is_empty() {
            return Err(ProvenanceError::MissingSource);
        }
        if exchange.is_empty() {
            return Err(ProvenanceError::MissingExchange(envelope.delivery_tag));
        }

        Ok(Self {
            source_uri,
            exchange,
            routing_key: routing_key.into(),
            envelope,
            body,
            received_at_ms,
        })
    }

    /// The broker URI of the tap that received this message (redacted).
    pub fn source_uri(&self) -> &str {
        &self.source_uri
    }

    /// The exchange the message was published to.
    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    /// The routing key the message was published with.
    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    /// Protocol metadata.
    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    /// The raw body.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Take ownership of the body.
    pub fn into_body(self) -> Vec<u8> {
        self.body
    }

    /// When the tap received the message, in Unix milliseconds.
    pub fn received_at_ms(&self) -> u64 {
        self.received_at_ms
    }

    /// When the tap received the message.
    pub fn received_at(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_millis(self.received_at_ms)
    }
}

/// Get current Unix timestamp in milliseconds.
pub fn current_timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
