//! NATS JetStream implementation of the EventLog trait
//!
//! Layout: every topic is one stream named after the topic, with one subject
//! per partition (`<topic>.<partition>`). The publish acknowledgment's stream
//! sequence is the record's offset. A consumer group owns one durable pull
//! consumer per topic partition, with explicit acks and a single message in
//! flight, so acking a message is committing its offset and per-partition
//! order is preserved.

use crate::partitioner::Partitioner;
use crate::{
    BusError, BusMessage, BusResult, Commit, ConsumerGroup, Delivery, EventLog, GroupSession,
    GroupSpec, InitialOffset, OutboundRecord, Position, KEY_HEADER,
};
use async_nats::jetstream::{self, consumer, stream};
use async_nats::{Client, HeaderMap};
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Connection settings for [`JetStreamLog::connect`]
#[derive(Debug, Clone)]
pub struct JetStreamConfig {
    /// Server URLs, e.g. `nats://localhost:4222`
    pub servers: Vec<String>,
    pub partitions: u32,
    /// Retention of records in each topic stream
    pub stream_max_age: Duration,
}

impl Default for JetStreamConfig {
    fn default() -> Self {
        Self {
            servers: vec!["nats://localhost:4222".to_string()],
            partitions: 8,
            stream_max_age: Duration::from_secs(60 * 60 * 24 * 14),
        }
    }
}

/// EventLog implementation on NATS JetStream
///
/// # Example
/// ```rust,no_run
/// use event_bus::{EventLog, JetStreamConfig, JetStreamLog, OutboundRecord};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let log = JetStreamLog::connect(&JetStreamConfig::default()).await?;
/// let record = OutboundRecord::new(b"{}".to_vec()).with_key(Some("alice".into()));
/// log.append("starters", record).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct JetStreamLog {
    client: Client,
    context: jetstream::Context,
    partitioner: Arc<Partitioner>,
    stream_max_age: Duration,
}

impl JetStreamLog {
    /// Connect to the configured servers
    pub async fn connect(config: &JetStreamConfig) -> BusResult<Self> {
        let servers: Vec<&str> = config
            .servers
            .iter()
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .collect();
        if servers.is_empty() {
            return Err(BusError::Config("at least one NATS server is required".to_string()));
        }

        let client = async_nats::connect(servers.join(","))
            .await
            .map_err(|e| BusError::Connection(e.to_string()))?;

        info!(servers = %servers.join(","), "Connected to NATS");

        Ok(Self::new(client, config.partitions).with_stream_max_age(config.stream_max_age))
    }

    /// Create a log from an already-connected client
    pub fn new(client: Client, partitions: u32) -> Self {
        let context = jetstream::new(client.clone());
        Self {
            client,
            context,
            partitioner: Arc::new(Partitioner::new(partitions)),
            stream_max_age: JetStreamConfig::default().stream_max_age,
        }
    }

    pub fn with_stream_max_age(mut self, max_age: Duration) -> Self {
        self.stream_max_age = max_age;
        self
    }

    /// Get a reference to the underlying NATS client
    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn partitions(&self) -> u32 {
        self.partitioner.partitions()
    }

    async fn ensure_stream(&self, topic: &str) -> BusResult<stream::Stream> {
        let name = stream_name(topic);
        if let Ok(existing) = self.context.get_stream(&name).await {
            return Ok(existing);
        }

        let config = stream::Config {
            name: name.clone(),
            subjects: vec![format!("{}.*", topic)],
            max_age: self.stream_max_age,
            ..Default::default()
        };

        let created = self
            .context
            .get_or_create_stream(config)
            .await
            .map_err(|e| BusError::Connection(format!("stream {}: {}", name, e)))?;

        debug!(stream = %name, topic = %topic, "Created JetStream stream");
        Ok(created)
    }
}

/// Stream names may not contain subject tokens or whitespace
fn stream_name(topic: &str) -> String {
    topic
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

fn durable_name(group: &str, topic: &str, partition: u32) -> String {
    format!("{}_{}_{}", stream_name(group), stream_name(topic), partition)
}

fn partition_subject(topic: &str, partition: u32) -> String {
    format!("{}.{}", topic, partition)
}

fn to_header_map(record: &OutboundRecord) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in &record.headers {
        headers.insert(name.as_str(), value.as_str());
    }
    if let Some(key) = &record.key {
        headers.insert(KEY_HEADER, key.as_str());
    }
    headers
}

fn from_header_map(nats_headers: Option<&HeaderMap>) -> HashMap<String, String> {
    let mut headers = HashMap::new();
    if let Some(nats_headers) = nats_headers {
        for (name, values) in nats_headers.iter() {
            // Take the first value for each header
            if let Some(value) = values.first() {
                headers.insert(name.to_string(), value.to_string());
            }
        }
    }
    headers
}

#[async_trait]
impl EventLog for JetStreamLog {
    async fn append(&self, topic: &str, record: OutboundRecord) -> BusResult<Position> {
        if topic.trim().is_empty() {
            return Err(BusError::Publish("topic must not be empty".to_string()));
        }

        self.ensure_stream(topic).await?;

        let partition = self.partitioner.assign(record.key.as_deref());
        let headers = to_header_map(&record);

        let ack = self
            .context
            .publish_with_headers(partition_subject(topic, partition), headers, record.payload.into())
            .await
            .map_err(|e| BusError::Publish(e.to_string()))?
            .await
            .map_err(|e| BusError::Publish(e.to_string()))?;

        Ok(Position {
            topic: topic.to_string(),
            partition,
            offset: ack.sequence,
        })
    }

    async fn consumer_group(&self, spec: GroupSpec) -> BusResult<Arc<dyn ConsumerGroup>> {
        if spec.group_id.trim().is_empty() {
            return Err(BusError::Config("group id must not be empty".to_string()));
        }

        Ok(Arc::new(JetStreamGroup {
            log: self.clone(),
            spec,
            closed: CancellationToken::new(),
        }))
    }
}

struct JetStreamGroup {
    log: JetStreamLog,
    spec: GroupSpec,
    closed: CancellationToken,
}

impl JetStreamGroup {
    async fn partition_stream(
        &self,
        stream: &stream::Stream,
        topic: &str,
        partition: u32,
    ) -> BusResult<BoxStream<'static, BusResult<Delivery>>> {
        let durable = durable_name(&self.spec.group_id, topic, partition);
        let deliver_policy = match self.spec.initial_offset {
            InitialOffset::Oldest => consumer::DeliverPolicy::All,
            InitialOffset::Newest => consumer::DeliverPolicy::New,
        };

        let pull = stream
            .get_or_create_consumer(
                &durable,
                consumer::pull::Config {
                    durable_name: Some(durable.clone()),
                    filter_subject: partition_subject(topic, partition),
                    ack_policy: consumer::AckPolicy::Explicit,
                    deliver_policy,
                    ack_wait: self.spec.session_timeout,
                    max_ack_pending: 1,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| BusError::Subscribe(format!("consumer {}: {}", durable, e)))?;

        let messages = pull
            .stream()
            .max_messages_per_batch(1)
            .heartbeat(self.spec.heartbeat_interval)
            .expires(self.spec.session_timeout)
            .messages()
            .await
            .map_err(|e| BusError::Subscribe(format!("consumer {}: {}", durable, e)))?;

        let topic = topic.to_string();
        let mapped = messages.map(move |item| {
            let message = item.map_err(|e| BusError::Subscribe(e.to_string()))?;
            let offset = message
                .info()
                .map(|info| info.stream_sequence)
                .map_err(|e| BusError::Internal(e.to_string()))?;

            let headers = from_header_map(message.message.headers.as_ref());
            let key = headers.get(KEY_HEADER).cloned();
            let bus_message =
                BusMessage::new(topic.clone(), partition, offset, message.message.payload.to_vec())
                    .with_key(key)
                    .with_headers(headers);

            Ok(Delivery::new(bus_message, JetStreamCommit { message }))
        });

        Ok(mapped.boxed())
    }
}

#[async_trait]
impl ConsumerGroup for JetStreamGroup {
    async fn join(&self) -> BusResult<GroupSession> {
        if self.closed.is_cancelled() {
            return Err(BusError::Closed(self.spec.group_id.clone()));
        }

        let mut partitions = Vec::new();
        for topic in &self.spec.topics {
            let stream = self.log.ensure_stream(topic).await?;
            for partition in 0..self.log.partitions() {
                partitions.push(self.partition_stream(&stream, topic, partition).await?);
            }
        }

        info!(
            group = %self.spec.group_id,
            topics = ?self.spec.topics,
            partitions = partitions.len(),
            "Joined JetStream consumer group"
        );

        let session = futures::stream::select_all(partitions)
            .take_until(self.closed.clone().cancelled_owned());

        Ok(session.boxed())
    }

    async fn close(&self) -> BusResult<()> {
        self.closed.cancel();
        Ok(())
    }
}

struct JetStreamCommit {
    message: jetstream::Message,
}

#[async_trait]
impl Commit for JetStreamCommit {
    async fn commit(&self) -> BusResult<()> {
        self.message
            .ack()
            .await
            .map_err(|e| BusError::Commit(e.to_string()))
    }

    /// In-progress ack: resets the consumer's `ack_wait` timer
    async fn keep_alive(&self) -> BusResult<()> {
        self.message
            .ack_with(jetstream::AckKind::Progress)
            .await
            .map_err(|e| BusError::Commit(e.to_string()))
    }
}
