//! In-memory implementation of the EventLog trait for testing and development

use crate::partitioner::Partitioner;
use crate::{
    BusError, BusMessage, BusResult, Commit, ConsumerGroup, Delivery, EventLog, GroupSession,
    GroupSpec, InitialOffset, OutboundRecord, Position,
};
use async_trait::async_trait;
use futures::stream::StreamExt;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;
use tracing::debug;

const DEFAULT_PARTITIONS: u32 = 8;

#[derive(Debug, Clone)]
struct StoredRecord {
    key: Option<String>,
    headers: HashMap<String, String>,
    payload: Vec<u8>,
}

/// (group, topic, partition)
type OffsetKey = (String, String, u32);

#[derive(Debug, Default)]
struct Inner {
    topics: HashMap<String, Vec<Vec<StoredRecord>>>,
    /// Next offset to read, per group and partition
    committed: HashMap<OffsetKey, u64>,
    generations: HashMap<String, u64>,
    keep_alives: HashMap<String, u64>,
    closed: HashSet<String>,
}

impl Inner {
    fn partitions_mut(&mut self, topic: &str, count: u32) -> &mut Vec<Vec<StoredRecord>> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| vec![Vec::new(); count as usize])
    }

    fn generation(&self, group: &str) -> u64 {
        self.generations.get(group).copied().unwrap_or(0)
    }
}

/// EventLog implementation backed by process memory
///
/// Every topic has a fixed number of partitions. Records are never dropped,
/// and each consumer group tracks a committed offset per partition, so a
/// group that rejoins resumes from its last commit. A group has a single
/// member here: every session is assigned all partitions of its topics.
///
/// # Example
/// ```rust
/// use event_bus::{EventLog, InMemoryLog, OutboundRecord};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let log = InMemoryLog::with_partitions(4);
/// let record = OutboundRecord::new(b"{}".to_vec()).with_key(Some("alice".into()));
/// let position = log.append("starters", record).await?;
/// assert_eq!(position.offset, 0);
/// assert_eq!(log.len("starters"), 1);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct InMemoryLog {
    inner: Arc<Mutex<Inner>>,
    notify: Arc<Notify>,
    partitioner: Arc<Partitioner>,
}

impl InMemoryLog {
    pub fn new() -> Self {
        Self::with_partitions(DEFAULT_PARTITIONS)
    }

    /// Create a log whose topics have `partitions` partitions (at least one)
    pub fn with_partitions(partitions: u32) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            notify: Arc::new(Notify::new()),
            partitioner: Arc::new(Partitioner::new(partitions)),
        }
    }

    pub fn partitions(&self) -> u32 {
        self.partitioner.partitions()
    }

    /// Total number of records appended to `topic`
    pub fn len(&self, topic: &str) -> usize {
        self.lock()
            .topics
            .get(topic)
            .map(|partitions| partitions.iter().map(Vec::len).sum())
            .unwrap_or(0)
    }

    pub fn is_empty(&self, topic: &str) -> bool {
        self.len(topic) == 0
    }

    /// Next offset `group` will read from `topic`/`partition`, once the group has joined
    pub fn committed_offset(&self, group: &str, topic: &str, partition: u32) -> Option<u64> {
        self.lock()
            .committed
            .get(&(group.to_string(), topic.to_string(), partition))
            .copied()
    }

    /// Keep-alive signals sent by `group` for deliveries still in progress
    pub fn keep_alives(&self, group: &str) -> u64 {
        self.lock().keep_alives.get(group).copied().unwrap_or(0)
    }

    /// End the current generation of `group`; open sessions finish and members rejoin
    pub fn rebalance(&self, group: &str) {
        {
            let mut inner = self.lock();
            let next = inner.generation(group) + 1;
            inner.generations.insert(group.to_string(), next);
        }
        debug!(group = %group, "In-memory group rebalanced");
        self.notify.notify_waiters();
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        lock_inner(&self.inner)
    }
}

fn lock_inner(inner: &Mutex<Inner>) -> MutexGuard<'_, Inner> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Default for InMemoryLog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventLog for InMemoryLog {
    async fn append(&self, topic: &str, record: OutboundRecord) -> BusResult<Position> {
        if topic.trim().is_empty() {
            return Err(BusError::Publish("topic must not be empty".to_string()));
        }

        let partition = self.partitioner.assign(record.key.as_deref());
        let offset = {
            let mut inner = self.lock();
            let log = &mut inner.partitions_mut(topic, self.partitions())[partition as usize];
            log.push(StoredRecord {
                key: record.key,
                headers: record.headers,
                payload: record.payload,
            });
            (log.len() - 1) as u64
        };

        self.notify.notify_waiters();

        Ok(Position {
            topic: topic.to_string(),
            partition,
            offset,
        })
    }

    async fn consumer_group(&self, spec: GroupSpec) -> BusResult<Arc<dyn ConsumerGroup>> {
        if spec.group_id.trim().is_empty() {
            return Err(BusError::Config("group id must not be empty".to_string()));
        }

        self.lock().closed.remove(&spec.group_id);

        Ok(Arc::new(InMemoryGroup {
            log: self.clone(),
            spec,
        }))
    }
}

struct InMemoryGroup {
    log: InMemoryLog,
    spec: GroupSpec,
}

struct Cursor {
    topic: String,
    partition: u32,
    next: u64,
}

enum Step {
    Deliver(usize, BusMessage),
    Wait,
    End,
}

#[async_trait]
impl ConsumerGroup for InMemoryGroup {
    async fn join(&self) -> BusResult<GroupSession> {
        let group = self.spec.group_id.clone();
        let partitions = self.log.partitions();

        let (generation, mut cursors) = {
            let mut inner = self.log.lock();
            if inner.closed.contains(&group) {
                return Err(BusError::Closed(group));
            }

            let mut cursors = Vec::new();
            for topic in &self.spec.topics {
                for partition in 0..partitions {
                    let len = inner.partitions_mut(topic, partitions)[partition as usize].len();
                    let key = (group.clone(), topic.clone(), partition);
                    let next = match inner.committed.get(&key).copied() {
                        Some(offset) => offset,
                        None => {
                            let start = match self.spec.initial_offset {
                                InitialOffset::Oldest => 0,
                                InitialOffset::Newest => len as u64,
                            };
                            inner.committed.insert(key, start);
                            start
                        }
                    };
                    cursors.push(Cursor {
                        topic: topic.clone(),
                        partition,
                        next,
                    });
                }
            }
            (inner.generation(&group), cursors)
        };

        debug!(group = %group, generation, partitions = cursors.len(), "Joined in-memory group");

        let inner = self.log.inner.clone();
        let notify = self.log.notify.clone();

        let stream = async_stream::stream! {
            let mut start = 0usize;
            loop {
                // Registered before inspecting state so no append is missed.
                let notified = notify.notified();

                let step = {
                    let guard = lock_inner(&inner);
                    if guard.closed.contains(&group) || guard.generation(&group) != generation {
                        Step::End
                    } else {
                        next_available(&guard, &cursors, start)
                    }
                };

                match step {
                    Step::Deliver(index, message) => {
                        cursors[index].next += 1;
                        start = (index + 1) % cursors.len().max(1);
                        let committer = MemoryCommit {
                            inner: inner.clone(),
                            key: (group.clone(), message.topic.clone(), message.partition),
                            offset: message.offset,
                        };
                        yield Ok(Delivery::new(message, committer));
                    }
                    Step::Wait => notified.await,
                    Step::End => break,
                }
            }
        };

        Ok(stream.boxed())
    }

    async fn close(&self) -> BusResult<()> {
        self.log.lock().closed.insert(self.spec.group_id.clone());
        self.log.notify.notify_waiters();
        Ok(())
    }
}

/// First cursor (round-robin from `start`) with a record waiting
fn next_available(inner: &Inner, cursors: &[Cursor], start: usize) -> Step {
    for i in 0..cursors.len() {
        let index = (start + i) % cursors.len();
        let cursor = &cursors[index];
        let record = inner
            .topics
            .get(&cursor.topic)
            .and_then(|partitions| partitions.get(cursor.partition as usize))
            .and_then(|log| log.get(cursor.next as usize));

        if let Some(record) = record {
            let message = BusMessage::new(
                cursor.topic.clone(),
                cursor.partition,
                cursor.next,
                record.payload.clone(),
            )
            .with_key(record.key.clone())
            .with_headers(record.headers.clone());
            return Step::Deliver(index, message);
        }
    }
    Step::Wait
}

struct MemoryCommit {
    inner: Arc<Mutex<Inner>>,
    key: OffsetKey,
    offset: u64,
}

#[async_trait]
impl Commit for MemoryCommit {
    async fn commit(&self) -> BusResult<()> {
        let mut inner = lock_inner(&self.inner);
        let committed = inner.committed.entry(self.key.clone()).or_insert(0);
        *committed = (*committed).max(self.offset + 1);
        Ok(())
    }

    async fn keep_alive(&self) -> BusResult<()> {
        let mut inner = lock_inner(&self.inner);
        *inner.keep_alives.entry(self.key.0.clone()).or_insert(0) += 1;
        Ok(())
    }
}
