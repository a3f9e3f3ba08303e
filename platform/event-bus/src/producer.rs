//! Envelope producer.
//!
//! Publishing is synchronous from the caller's view: `publish` returns the
//! position the broker assigned, or an error with nothing appended.

use crate::envelope::{EnvelopeError, EventEnvelope};
use crate::{BusError, EventLog, OutboundRecord, Position, EVENT_TYPE_HEADER};
use std::sync::Arc;
use tracing::{debug, warn};

/// Errors returned by [`Producer::publish`]
#[derive(Debug, thiserror::Error)]
pub enum ProduceError {
    #[error("no topic given and no default topic configured")]
    MissingTopic,

    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    #[error(transparent)]
    Bus(#[from] BusError),
}

/// Publishes envelopes to an [`EventLog`]
///
/// Cheap to clone and safe to share between concurrent callers.
///
/// # Example
/// ```rust
/// use event_bus::{EventEnvelope, InMemoryLog, Producer};
/// use std::sync::Arc;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let producer = Producer::new(Arc::new(InMemoryLog::new()));
/// let envelope = EventEnvelope::new("delete")?.with_key("alice");
/// let position = producer.publish(Some("starters"), envelope).await?;
/// assert_eq!(position.topic, "starters");
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Producer {
    log: Arc<dyn EventLog>,
    default_topic: Option<String>,
}

impl Producer {
    pub fn new(log: Arc<dyn EventLog>) -> Self {
        Self {
            log,
            default_topic: None,
        }
    }

    /// Bind the topic used when `publish` is called without one
    pub fn with_default_topic(mut self, topic: impl Into<String>) -> Self {
        let topic = topic.into();
        self.default_topic = if topic.trim().is_empty() {
            None
        } else {
            Some(topic)
        };
        self
    }

    pub fn default_topic(&self) -> Option<&str> {
        self.default_topic.as_deref()
    }

    /// Publish `envelope` and wait for the broker acknowledgment
    ///
    /// The partition key is the envelope's `key`, else its `domain`, else none.
    /// A missing timestamp is filled right before serialization.
    pub async fn publish(
        &self,
        topic: Option<&str>,
        mut envelope: EventEnvelope,
    ) -> Result<Position, ProduceError> {
        let topic = topic
            .filter(|t| !t.trim().is_empty())
            .or(self.default_topic.as_deref())
            .ok_or(ProduceError::MissingTopic)?;

        if envelope.event_type().trim().is_empty() {
            return Err(EnvelopeError::MissingType.into());
        }

        envelope.stamp_if_missing();
        let payload = envelope.to_bytes()?;

        let record = OutboundRecord::new(payload)
            .with_key(envelope.routing_key().map(str::to_string))
            .with_header(EVENT_TYPE_HEADER, envelope.event_type());

        match self.log.append(topic, record).await {
            Ok(position) => {
                debug!(
                    topic = %position.topic,
                    partition = position.partition,
                    offset = position.offset,
                    event_type = %envelope.event_type(),
                    key = %envelope.routing_key().unwrap_or("-"),
                    "Event published"
                );
                Ok(position)
            }
            Err(e) => {
                warn!(
                    topic = %topic,
                    event_type = %envelope.event_type(),
                    key = %envelope.routing_key().unwrap_or("-"),
                    error = %e,
                    "Failed to publish event"
                );
                Err(e.into())
            }
        }
    }
}
