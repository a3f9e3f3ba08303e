//! # Event Envelope
//!
//! The immutable unit of propagation through the event log.
//!
//! ## Wire Shape
//!
//! ```json
//! {
//!   "type": "insert",
//!   "key": "alice",
//!   "domain": "alice",
//!   "timestamp": "2024-01-01T00:00:00Z",
//!   "payload": {"name": "Alice A."},
//!   "metadata": {"source": "starter-service"},
//!   "retries": 0
//! }
//! ```
//!
//! Only `type` is required. `payload` is kept as raw JSON and decoded by the
//! handler that understands the event type.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use std::collections::BTreeMap;

/// Errors raised while building, encoding or decoding an envelope
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("event type is required")]
    MissingType,

    #[error("failed to encode envelope: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("failed to decode envelope: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("failed to decode payload of '{event_type}' event: {source}")]
    Payload {
        event_type: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Event envelope carried by the log
///
/// Built with [`EventEnvelope::new`] and the `with_*` options. Each option sets
/// one field; applying it twice gives the same result, and conflicting options
/// are last-write-wins.
///
/// # Examples
///
/// ```rust
/// use event_bus::EventEnvelope;
///
/// let envelope = EventEnvelope::new("insert")
///     .unwrap()
///     .with_key("alice")
///     .with_metadata("source", "starter-service");
///
/// assert_eq!(envelope.event_type(), "insert");
/// assert_eq!(envelope.routing_key(), Some("alice"));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    #[serde(rename = "type")]
    event_type: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    key: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    domain: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    timestamp: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    payload: Option<Box<RawValue>>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    metadata: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "is_zero")]
    retries: u32,
}

fn is_zero(value: &u32) -> bool {
    *value == 0
}

fn non_null(raw: Box<RawValue>) -> Option<Box<RawValue>> {
    (raw.get().trim() != "null").then_some(raw)
}

impl EventEnvelope {
    /// Create an envelope for `event_type`, timestamped now
    pub fn new(event_type: impl Into<String>) -> Result<Self, EnvelopeError> {
        let event_type = event_type.into();
        if event_type.trim().is_empty() {
            return Err(EnvelopeError::MissingType);
        }

        Ok(Self {
            event_type,
            key: None,
            domain: None,
            timestamp: Some(Utc::now()),
            payload: None,
            metadata: BTreeMap::new(),
            retries: 0,
        })
    }

    /// Set the partition key
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Set the business domain of the affected entity
    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Serialize `payload` into the envelope
    ///
    /// A payload that serializes to JSON `null` leaves the envelope without
    /// one, the same as it reads back off the wire.
    pub fn with_payload<T: Serialize>(mut self, payload: &T) -> Result<Self, EnvelopeError> {
        let raw = serde_json::value::to_raw_value(payload).map_err(EnvelopeError::Encode)?;
        self.payload = non_null(raw);
        Ok(self)
    }

    /// Attach an already-encoded JSON payload; `null` clears it
    pub fn with_raw_payload(mut self, payload: Box<RawValue>) -> Self {
        self.payload = non_null(payload);
        self
    }

    pub fn with_metadata(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(name.into(), value.into());
        self
    }

    /// Set the retry counter. Only producers replaying a message do this.
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    pub fn domain(&self) -> Option<&str> {
        self.domain.as_deref()
    }

    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.timestamp
    }

    pub fn payload(&self) -> Option<&RawValue> {
        self.payload.as_deref()
    }

    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Partition key: `key`, else `domain`, else none (broker-assigned)
    pub fn routing_key(&self) -> Option<&str> {
        self.key()
            .filter(|k| !k.is_empty())
            .or_else(|| self.domain().filter(|d| !d.is_empty()))
    }

    /// Fill the timestamp with the current time if it is unset
    pub(crate) fn stamp_if_missing(&mut self) {
        if self.timestamp.is_none() {
            self.timestamp = Some(Utc::now());
        }
    }

    /// Decode the payload into `T`.
    ///
    /// Returns `Ok(None)` when the envelope carries no payload.
    pub fn decode_payload<T: DeserializeOwned>(&self) -> Result<Option<T>, EnvelopeError> {
        let Some(raw) = self.payload.as_deref() else {
            return Ok(None);
        };

        serde_json::from_str(raw.get())
            .map(Some)
            .map_err(|source| EnvelopeError::Payload {
                event_type: self.event_type.clone(),
                source,
            })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, EnvelopeError> {
        serde_json::to_vec(self).map_err(EnvelopeError::Encode)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        let envelope: Self = serde_json::from_slice(bytes).map_err(EnvelopeError::Decode)?;
        if envelope.event_type.trim().is_empty() {
            return Err(EnvelopeError::MissingType);
        }
        Ok(envelope)
    }
}

impl PartialEq for EventEnvelope {
    fn eq(&self, other: &Self) -> bool {
        self.event_type == other.event_type
            && self.key == other.key
            && self.domain == other.domain
            && self.timestamp == other.timestamp
            && self.payload.as_deref().map(RawValue::get)
                == other.payload.as_deref().map(RawValue::get)
            && self.metadata == other.metadata
            && self.retries == other.retries
    }
}

impl Eq for EventEnvelope {}
