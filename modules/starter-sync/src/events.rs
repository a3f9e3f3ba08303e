//! Event types and constructors for the sync topics
//!
//! The producing side (starter CRUD, leader assignment) builds envelopes here;
//! the consuming side maps the type tag back with [`EventRoute::from_type`].

use event_bus::{EnvelopeError, EventEnvelope, Producer};
use tokio::task::JoinHandle;

use crate::models::{LeaderAssignmentNotification, Starter, StarterDocument};

pub const EVENT_INSERT: &str = "insert";
pub const EVENT_UPDATE: &str = "update";
pub const EVENT_DELETE: &str = "delete";
pub const EVENT_INDEX: &str = "index";
pub const EVENT_LEADER_ASSIGNMENT: &str = "notification-leader-assignment";

/// Mutation that triggered a starter sync event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StarterEventKind {
    Insert,
    Update,
    Delete,
    /// Re-index request without a mutation
    Index,
}

impl StarterEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StarterEventKind::Insert => EVENT_INSERT,
            StarterEventKind::Update => EVENT_UPDATE,
            StarterEventKind::Delete => EVENT_DELETE,
            StarterEventKind::Index => EVENT_INDEX,
        }
    }
}

/// Dispatch target for an envelope type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventRoute {
    Starter(StarterEventKind),
    LeaderAssignment,
    Unknown,
}

impl EventRoute {
    pub fn from_type(event_type: &str) -> Self {
        match event_type {
            EVENT_INSERT => EventRoute::Starter(StarterEventKind::Insert),
            EVENT_UPDATE => EventRoute::Starter(StarterEventKind::Update),
            EVENT_DELETE => EventRoute::Starter(StarterEventKind::Delete),
            EVENT_INDEX => EventRoute::Starter(StarterEventKind::Index),
            EVENT_LEADER_ASSIGNMENT => EventRoute::LeaderAssignment,
            _ => EventRoute::Unknown,
        }
    }
}

/// Envelope for a starter mutation; the payload is a hint only
pub fn starter_event(
    kind: StarterEventKind,
    starter: &Starter,
) -> Result<EventEnvelope, EnvelopeError> {
    EventEnvelope::new(kind.as_str())?
        .with_key(starter.domain.as_str())
        .with_domain(starter.domain.as_str())
        .with_payload(&StarterDocument::from(starter))
}

/// Envelope for a starter that no longer exists
pub fn delete_event(domain: &str) -> Result<EventEnvelope, EnvelopeError> {
    Ok(EventEnvelope::new(EVENT_DELETE)?
        .with_key(domain)
        .with_domain(domain))
}

/// Envelope asking consumers to re-read `domain` and index it
pub fn index_event(domain: &str) -> Result<EventEnvelope, EnvelopeError> {
    Ok(EventEnvelope::new(EVENT_INDEX)?
        .with_key(domain)
        .with_domain(domain))
}

/// Envelope for a leader assignment, ordered per department
pub fn leader_assignment_event(
    notification: &LeaderAssignmentNotification,
) -> Result<EventEnvelope, EnvelopeError> {
    let mut envelope = EventEnvelope::new(EVENT_LEADER_ASSIGNMENT)?
        .with_key(notification.department.as_str())
        .with_domain(notification.leader_domain.as_str())
        .with_payload(notification)?;
    if let Some(assigned_by) = &notification.assigned_by {
        envelope = envelope.with_metadata("assigned_by", assigned_by.as_str());
    }
    Ok(envelope)
}

/// Publish without blocking the caller; failures are only logged
///
/// Request handlers fire sync events this way so a broker outage never fails
/// the business operation. The returned handle may be ignored.
pub fn publish_detached(
    producer: &Producer,
    topic: Option<String>,
    envelope: EventEnvelope,
) -> JoinHandle<()> {
    let producer = producer.clone();
    tokio::spawn(async move {
        let event_type = envelope.event_type().to_string();
        let key = envelope.routing_key().unwrap_or("-").to_string();

        match producer.publish(topic.as_deref(), envelope).await {
            Ok(position) => {
                tracing::debug!(
                    event_type = %event_type,
                    key = %key,
                    topic = %position.topic,
                    partition = position.partition,
                    offset = position.offset,
                    "Sync event published"
                );
            }
            Err(e) => {
                tracing::error!(
                    event_type = %event_type,
                    key = %key,
                    error = %e,
                    "Failed to publish sync event"
                );
            }
        }
    })
}
