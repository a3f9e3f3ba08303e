//! # Event Bus
//!
//! Infrastructure for propagating domain events from a system of record to
//! downstream consumers over a partitioned, at-least-once message log.
//!
//! ## Building Blocks
//!
//! - [`EventEnvelope`]: the unit of propagation (type, key, domain, timestamp,
//!   opaque payload, metadata, retry counter)
//! - [`Producer`]: publishes envelopes, routing by key so events for the same
//!   entity stay ordered
//! - [`ConsumerGroupRuntime`]: joins a consumer group, dispatches each message
//!   to an [`EventHandler`] through [`retry_with_backoff`], then commits
//! - [`EventLog`] / [`ConsumerGroup`]: the broker seam
//!
//! ## Implementations
//!
//! - **JetStreamLog**: production log on NATS JetStream
//! - **InMemoryLog**: test/dev log with partitions and committed offsets
//!
//! ## Usage
//!
//! ```rust,no_run
//! use event_bus::{EventEnvelope, EventLog, InMemoryLog, Producer};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let log: Arc<dyn EventLog> = Arc::new(InMemoryLog::new());
//! let producer = Producer::new(log).with_default_topic("starters");
//!
//! let envelope = EventEnvelope::new("insert")?.with_key("alice");
//! let position = producer.publish(None, envelope).await?;
//! println!("stored at {}:{}", position.partition, position.offset);
//! # Ok(())
//! # }
//! ```

pub mod consumer;
pub mod consumer_retry;
mod envelope;
mod inmemory_log;
mod jetstream_log;
mod partitioner;
mod producer;

pub use consumer::{
    ConsumerConfig, ConsumerError, ConsumerGroupRuntime, ConsumerObserver, DeliveryOutcome,
    EventHandler, HandlerError, RuntimeState,
};
pub use consumer_retry::{retry_with_backoff, RetryConfig, RetryError};
pub use envelope::{EnvelopeError, EventEnvelope};
pub use inmemory_log::InMemoryLog;
pub use jetstream_log::{JetStreamConfig, JetStreamLog};
pub use partitioner::{fnv1a_32, partition_for, Partitioner};
pub use producer::{ProduceError, Producer};

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Header carrying the partition key of a record
pub const KEY_HEADER: &str = "Partition-Key";

/// Header carrying the envelope's event type
pub const EVENT_TYPE_HEADER: &str = "Event-Type";

/// Physical position assigned by the broker to an appended record
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Position {
    pub topic: String,
    pub partition: u32,
    pub offset: u64,
}

/// A record handed to [`EventLog::append`]
#[derive(Debug, Clone, Default)]
pub struct OutboundRecord {
    /// Partition key; `None` lets the log spread the record
    pub key: Option<String>,
    pub headers: HashMap<String, String>,
    pub payload: Vec<u8>,
}

impl OutboundRecord {
    pub fn new(payload: Vec<u8>) -> Self {
        Self {
            key: None,
            headers: HashMap::new(),
            payload,
        }
    }

    pub fn with_key(mut self, key: Option<String>) -> Self {
        self.key = key;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

/// A message received from a consumer group session
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub topic: String,
    pub partition: u32,
    pub offset: u64,
    pub key: Option<String>,
    /// The message payload (raw bytes)
    pub payload: Vec<u8>,
    pub headers: HashMap<String, String>,
}

impl BusMessage {
    pub fn new(topic: String, partition: u32, offset: u64, payload: Vec<u8>) -> Self {
        Self {
            topic,
            partition,
            offset,
            key: None,
            payload,
            headers: HashMap::new(),
        }
    }

    pub fn with_key(mut self, key: Option<String>) -> Self {
        self.key = key;
        self
    }

    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers = headers;
        self
    }
}

/// Marks a delivered message as consumed for its group
#[async_trait]
pub trait Commit: Send + Sync {
    async fn commit(&self) -> BusResult<()>;

    /// Tell the log the message is still being worked on, so its delivery
    /// deadline is pushed back. Logs without a redelivery deadline ignore it.
    async fn keep_alive(&self) -> BusResult<()> {
        Ok(())
    }
}

/// A message together with the handle that commits its offset
pub struct Delivery {
    pub message: BusMessage,
    committer: Box<dyn Commit>,
}

impl Delivery {
    pub fn new(message: BusMessage, committer: impl Commit + 'static) -> Self {
        Self {
            message,
            committer: Box::new(committer),
        }
    }

    pub async fn commit(&self) -> BusResult<()> {
        self.committer.commit().await
    }

    pub async fn keep_alive(&self) -> BusResult<()> {
        self.committer.keep_alive().await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("message", &self.message)
            .finish_non_exhaustive()
    }
}

/// One generation of group membership.
///
/// The stream ends when the generation ends (rebalance); an `Err` item is a
/// transport failure. In both cases the caller rejoins.
pub type GroupSession = BoxStream<'static, BusResult<Delivery>>;

/// Where a group without committed progress starts reading
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InitialOffset {
    #[default]
    Oldest,
    Newest,
}

impl FromStr for InitialOffset {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "oldest" => Ok(InitialOffset::Oldest),
            "newest" => Ok(InitialOffset::Newest),
            other => Err(format!(
                "invalid initial offset '{}': expected 'oldest' or 'newest'",
                other
            )),
        }
    }
}

/// Membership request for a consumer group
#[derive(Debug, Clone)]
pub struct GroupSpec {
    pub group_id: String,
    pub topics: Vec<String>,
    pub initial_offset: InitialOffset,
    pub session_timeout: Duration,
    pub heartbeat_interval: Duration,
}

/// Errors that can occur when using the event log
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("failed to publish message: {0}")]
    Publish(String),

    #[error("failed to subscribe: {0}")]
    Subscribe(String),

    #[error("failed to commit offset: {0}")]
    Commit(String),

    #[error("consumer group '{0}' is closed")]
    Closed(String),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type for event log operations
pub type BusResult<T> = Result<T, BusError>;

/// A consumer group handle, owned by exactly one runtime
#[async_trait]
pub trait ConsumerGroup: Send + Sync {
    /// Join the group and receive the partitions assigned for this generation
    async fn join(&self) -> BusResult<GroupSession>;

    /// Leave the group; later joins fail with [`BusError::Closed`]
    async fn close(&self) -> BusResult<()>;
}

/// Partitioned, append-only message log
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Append a record and wait for the broker to acknowledge it
    async fn append(&self, topic: &str, record: OutboundRecord) -> BusResult<Position>;

    /// Create a consumer group handle for the given membership request
    async fn consumer_group(&self, spec: GroupSpec) -> BusResult<Arc<dyn ConsumerGroup>>;
}

impl fmt::Debug for dyn EventLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventLog")
    }
}
