//! Consumer-group runtime
//!
//! [`ConsumerGroupRuntime`] joins a consumer group, decodes every delivered
//! message into an [`EventEnvelope`] and hands it to an [`EventHandler`]
//! through [`retry_with_backoff`]. The offset is committed once the handler
//! succeeds, once retries are exhausted, or when the payload is malformed.
//! A message whose processing is interrupted by shutdown is left uncommitted
//! and is redelivered to the next member of the group. While a message is
//! being handled the runtime sends a keep-alive every heartbeat interval.
//!
//! Sessions end on rebalance or transport errors; the runtime then rejoins
//! until [`ConsumerGroupRuntime::stop`] is called.

use crate::consumer_retry::{retry_with_backoff, RetryConfig, RetryError};
use crate::envelope::EventEnvelope;
use crate::producer::Producer;
use crate::{BusError, ConsumerGroup, Delivery, EventLog, GroupSpec, InitialOffset};
use async_trait::async_trait;
use futures::StreamExt;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

/// Error type returned by event handlers
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Processes one decoded event
///
/// Handlers must be idempotent: delivery is at-least-once, and a message is
/// retried with backoff while `handle` returns `Err`.
///
/// `cancel` is the runtime's shutdown token. The runtime also drops a running
/// `handle` future as soon as it fires, so handlers only need it to stop work
/// they spawned themselves.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(
        &self,
        event: &EventEnvelope,
        cancel: &CancellationToken,
    ) -> Result<(), HandlerError>;
}

/// What happened to a delivered message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeliveryOutcome {
    /// Handler succeeded; offset committed
    Handled,
    /// Retries exhausted; offset committed
    Failed,
    /// Payload was not a valid envelope; offset committed
    Malformed,
    /// Retries exhausted and the envelope was republished to the dead-letter topic
    DeadLettered,
    /// Shutdown interrupted processing; offset not committed
    Interrupted,
}

impl DeliveryOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryOutcome::Handled => "handled",
            DeliveryOutcome::Failed => "failed",
            DeliveryOutcome::Malformed => "malformed",
            DeliveryOutcome::DeadLettered => "dead_lettered",
            DeliveryOutcome::Interrupted => "interrupted",
        }
    }

    /// Whether the offset is committed after this outcome
    pub fn commits(&self) -> bool {
        !matches!(self, DeliveryOutcome::Interrupted)
    }
}

impl fmt::Display for DeliveryOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Hook notified after every delivery, e.g. for metrics
pub trait ConsumerObserver: Send + Sync {
    fn on_delivery(&self, topic: &str, outcome: DeliveryOutcome);
}

/// Consumer-group runtime configuration
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub group_id: String,
    pub topics: Vec<String>,
    pub initial_offset: InitialOffset,
    pub retry: RetryConfig,
    /// Pause before rejoining after a failed join or a transport error
    pub rejoin_backoff: Duration,
    pub session_timeout: Duration,
    pub heartbeat_interval: Duration,
    /// Republish envelopes whose retries are exhausted to this topic
    pub dead_letter_topic: Option<String>,
}

impl ConsumerConfig {
    pub fn new(group_id: impl Into<String>, topics: Vec<String>) -> Self {
        Self {
            group_id: group_id.into(),
            topics,
            initial_offset: InitialOffset::Oldest,
            retry: RetryConfig::default(),
            rejoin_backoff: Duration::from_secs(1),
            session_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(3),
            dead_letter_topic: None,
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_initial_offset(mut self, initial_offset: InitialOffset) -> Self {
        self.initial_offset = initial_offset;
        self
    }

    pub fn with_rejoin_backoff(mut self, backoff: Duration) -> Self {
        self.rejoin_backoff = backoff;
        self
    }

    pub fn with_dead_letter_topic(mut self, topic: impl Into<String>) -> Self {
        self.dead_letter_topic = Some(topic.into());
        self
    }

    pub fn validate(&self) -> Result<(), ConsumerError> {
        if self.group_id.trim().is_empty() {
            return Err(ConsumerError::Config("group id must not be empty".to_string()));
        }
        if self.topics.is_empty() {
            return Err(ConsumerError::Config("at least one topic is required".to_string()));
        }
        if self.topics.iter().any(|t| t.trim().is_empty()) {
            return Err(ConsumerError::Config("topic names must not be empty".to_string()));
        }
        if self.heartbeat_interval >= self.session_timeout {
            return Err(ConsumerError::Config(format!(
                "heartbeat interval ({:?}) must be shorter than session timeout ({:?})",
                self.heartbeat_interval, self.session_timeout
            )));
        }
        if let Some(dlq) = &self.dead_letter_topic {
            if dlq.trim().is_empty() {
                return Err(ConsumerError::Config(
                    "dead-letter topic must not be empty".to_string(),
                ));
            }
            if self.topics.contains(dlq) {
                return Err(ConsumerError::Config(format!(
                    "dead-letter topic '{}' is also consumed",
                    dlq
                )));
            }
        }
        Ok(())
    }

    pub fn group_spec(&self) -> GroupSpec {
        GroupSpec {
            group_id: self.group_id.clone(),
            topics: self.topics.clone(),
            initial_offset: self.initial_offset,
            session_timeout: self.session_timeout,
            heartbeat_interval: self.heartbeat_interval,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConsumerError {
    #[error("invalid consumer configuration: {0}")]
    Config(String),

    #[error("consumer runtime already started")]
    AlreadyStarted,

    #[error("consumer runtime stopped")]
    Stopped,

    #[error(transparent)]
    Bus(#[from] BusError),
}

/// Lifecycle of a [`ConsumerGroupRuntime`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeState {
    Created,
    Starting,
    Running,
    Stopping,
    Stopped,
}

/// Runs an [`EventHandler`] as a member of a consumer group
///
/// # Example
/// ```rust,no_run
/// use async_trait::async_trait;
/// use event_bus::{
///     ConsumerConfig, ConsumerGroupRuntime, EventEnvelope, EventHandler, HandlerError,
///     InMemoryLog,
/// };
/// use std::sync::Arc;
/// use tokio_util::sync::CancellationToken;
///
/// struct Print;
///
/// #[async_trait]
/// impl EventHandler for Print {
///     async fn handle(
///         &self,
///         event: &EventEnvelope,
///         _cancel: &CancellationToken,
///     ) -> Result<(), HandlerError> {
///         println!("{}", event.event_type());
///         Ok(())
///     }
/// }
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let config = ConsumerConfig::new("starter-sync", vec!["starters".to_string()]);
/// let runtime = ConsumerGroupRuntime::new(config, Arc::new(InMemoryLog::new()), Arc::new(Print)).await?;
/// runtime.start().await?;
/// runtime.stop().await?;
/// # Ok(())
/// # }
/// ```
pub struct ConsumerGroupRuntime {
    config: Arc<ConsumerConfig>,
    group: Arc<dyn ConsumerGroup>,
    handler: Arc<dyn EventHandler>,
    observer: Option<Arc<dyn ConsumerObserver>>,
    dead_letter: Option<Producer>,
    cancel: CancellationToken,
    state: Arc<watch::Sender<RuntimeState>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ConsumerGroupRuntime {
    /// Validate `config` and create the group handle; nothing is consumed until `start`
    pub async fn new(
        config: ConsumerConfig,
        log: Arc<dyn EventLog>,
        handler: Arc<dyn EventHandler>,
    ) -> Result<Self, ConsumerError> {
        config.validate()?;

        let group = log.consumer_group(config.group_spec()).await?;
        let dead_letter = config
            .dead_letter_topic
            .as_ref()
            .map(|topic| Producer::new(log.clone()).with_default_topic(topic.clone()));
        let (state, _) = watch::channel(RuntimeState::Created);

        Ok(Self {
            config: Arc::new(config),
            group,
            handler,
            observer: None,
            dead_letter,
            cancel: CancellationToken::new(),
            state: Arc::new(state),
            worker: Mutex::new(None),
        })
    }

    pub fn with_observer(mut self, observer: Arc<dyn ConsumerObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    pub fn state(&self) -> RuntimeState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<RuntimeState> {
        self.state.subscribe()
    }

    /// Spawn the consume loop and wait until the first group session is joined
    ///
    /// Fails with [`ConsumerError::AlreadyStarted`] when called twice and with
    /// [`ConsumerError::Stopped`] after `stop`.
    pub async fn start(&self) -> Result<(), ConsumerError> {
        {
            let mut worker = self.worker.lock().await;
            let current = self.state();
            match current {
                RuntimeState::Created => {}
                RuntimeState::Stopping | RuntimeState::Stopped => {
                    return Err(ConsumerError::Stopped)
                }
                RuntimeState::Starting | RuntimeState::Running => {
                    return Err(ConsumerError::AlreadyStarted)
                }
            }

            self.state.send_replace(RuntimeState::Starting);
            info!(
                group = %self.config.group_id,
                topics = ?self.config.topics,
                "Starting consumer group runtime"
            );

            let worker_loop = Worker {
                config: self.config.clone(),
                group: self.group.clone(),
                handler: self.handler.clone(),
                observer: self.observer.clone(),
                dead_letter: self.dead_letter.clone(),
                cancel: self.cancel.clone(),
                state: self.state.clone(),
            };
            *worker = Some(tokio::spawn(worker_loop.run()));
        }

        let mut state = self.state.subscribe();
        let reached = *state
            .wait_for(|s| {
                matches!(
                    s,
                    RuntimeState::Running | RuntimeState::Stopping | RuntimeState::Stopped
                )
            })
            .await
            .map_err(|_| ConsumerError::Stopped)?;

        match reached {
            RuntimeState::Running => Ok(()),
            _ => Err(ConsumerError::Stopped),
        }
    }

    /// Stop consuming, wait for the in-flight message and leave the group
    ///
    /// Idempotent, and safe to call on a runtime that was never started.
    pub async fn stop(&self) -> Result<(), ConsumerError> {
        let mut worker = self.worker.lock().await;
        if self.state() == RuntimeState::Stopped {
            return Ok(());
        }

        self.state.send_replace(RuntimeState::Stopping);
        self.cancel.cancel();

        if let Some(handle) = worker.take() {
            if let Err(e) = handle.await {
                error!(group = %self.config.group_id, error = %e, "Consumer worker panicked");
            }
        }

        let closed = self.group.close().await;
        self.state.send_replace(RuntimeState::Stopped);
        info!(group = %self.config.group_id, "Consumer group runtime stopped");

        closed.map_err(ConsumerError::from)
    }
}

impl Drop for ConsumerGroupRuntime {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// State moved into the spawned consume loop
struct Worker {
    config: Arc<ConsumerConfig>,
    group: Arc<dyn ConsumerGroup>,
    handler: Arc<dyn EventHandler>,
    observer: Option<Arc<dyn ConsumerObserver>>,
    dead_letter: Option<Producer>,
    cancel: CancellationToken,
    state: Arc<watch::Sender<RuntimeState>>,
}

impl Worker {
    async fn run(self) {
        let group_id = self.config.group_id.clone();

        'membership: loop {
            let joined = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break 'membership,
                joined = self.group.join() => joined,
            };

            let mut session = match joined {
                Ok(session) => session,
                Err(BusError::Closed(_)) => break 'membership,
                Err(e) => {
                    warn!(group = %group_id, error = %e, "Failed to join consumer group");
                    if self.pause().await {
                        continue 'membership;
                    }
                    break 'membership;
                }
            };

            self.state.send_if_modified(|state| {
                if *state == RuntimeState::Starting {
                    *state = RuntimeState::Running;
                    true
                } else {
                    false
                }
            });
            info!(group = %group_id, "Consumer group session started");

            loop {
                let next = tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => break 'membership,
                    next = session.next() => next,
                };

                match next {
                    Some(Ok(delivery)) => {
                        if self.process(&delivery).await == DeliveryOutcome::Interrupted {
                            break 'membership;
                        }
                    }
                    Some(Err(e)) => {
                        warn!(group = %group_id, error = %e, "Consumer group session failed");
                        if self.pause().await {
                            continue 'membership;
                        }
                        break 'membership;
                    }
                    None => {
                        info!(group = %group_id, "Consumer group session ended, rejoining");
                        continue 'membership;
                    }
                }
            }
        }

        debug!(group = %group_id, "Consumer worker exited");
    }

    /// Sleep for the rejoin backoff; false if cancelled meanwhile
    async fn pause(&self) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(self.config.rejoin_backoff) => true,
        }
    }

    async fn process(&self, delivery: &Delivery) -> DeliveryOutcome {
        let message = &delivery.message;
        let span = tracing::info_span!(
            "consume_event",
            topic = %message.topic,
            partition = message.partition,
            offset = message.offset,
            key = %message.key.as_deref().unwrap_or("-"),
            event_type = tracing::field::Empty,
        );

        async {
            let outcome = match EventEnvelope::from_bytes(&message.payload) {
                Ok(envelope) => {
                    tracing::Span::current().record("event_type", envelope.event_type());
                    self.dispatch_keeping_alive(delivery, &envelope).await
                }
                Err(e) => {
                    error!(error = %e, "Malformed event payload, skipping");
                    DeliveryOutcome::Malformed
                }
            };

            if outcome.commits() {
                if let Err(e) = delivery.commit().await {
                    warn!(error = %e, "Failed to commit offset, message may be redelivered");
                }
            }

            if let Some(observer) = &self.observer {
                observer.on_delivery(&message.topic, outcome);
            }

            debug!(outcome = %outcome, "Event processed");
            outcome
        }
        .instrument(span)
        .await
    }

    /// Run `dispatch`, signalling the log every heartbeat interval that the
    /// delivery is still in progress. Retries and backoff can outlast the
    /// log's redelivery deadline (JetStream `ack_wait`).
    async fn dispatch_keeping_alive(
        &self,
        delivery: &Delivery,
        envelope: &EventEnvelope,
    ) -> DeliveryOutcome {
        let dispatch = self.dispatch(envelope, &delivery.message.topic);
        tokio::pin!(dispatch);

        let period = self.config.heartbeat_interval;
        let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                outcome = &mut dispatch => return outcome,
                _ = heartbeat.tick() => {
                    if let Err(e) = delivery.keep_alive().await {
                        warn!(error = %e, "Failed to extend delivery deadline");
                    }
                }
            }
        }
    }

    async fn dispatch(&self, envelope: &EventEnvelope, topic: &str) -> DeliveryOutcome {
        let label = format!(
            "{}:{}",
            envelope.event_type(),
            envelope.routing_key().unwrap_or("-")
        );
        let handler = &self.handler;
        let cancel = &self.cancel;

        let result = retry_with_backoff(
            cancel,
            &self.config.retry,
            || handler.handle(envelope, cancel),
            &label,
        )
        .await;

        match result {
            Ok(()) => DeliveryOutcome::Handled,
            Err(RetryError::Cancelled { attempts, .. }) => {
                info!(
                    event_type = %envelope.event_type(),
                    attempts,
                    "Shutdown interrupted event processing, leaving offset uncommitted"
                );
                DeliveryOutcome::Interrupted
            }
            Err(err) => {
                let attempts = err.attempts();
                let reason = err.to_string();
                error!(
                    event_type = %envelope.event_type(),
                    attempts,
                    error = %reason,
                    "Event processing failed after retries"
                );
                self.dead_letter(envelope, topic, attempts, &reason).await
            }
        }
    }

    async fn dead_letter(
        &self,
        envelope: &EventEnvelope,
        topic: &str,
        attempts: u32,
        reason: &str,
    ) -> DeliveryOutcome {
        let Some(producer) = &self.dead_letter else {
            return DeliveryOutcome::Failed;
        };

        let dead = envelope
            .clone()
            .with_retries(attempts)
            .with_metadata("dlq_error", reason)
            .with_metadata("dlq_source_topic", topic);

        match producer.publish(None, dead).await {
            Ok(position) => {
                warn!(
                    dlq_topic = %position.topic,
                    dlq_offset = position.offset,
                    "Event sent to dead-letter topic"
                );
                DeliveryOutcome::DeadLettered
            }
            Err(e) => {
                error!(error = %e, "Failed to publish event to dead-letter topic");
                DeliveryOutcome::Failed
            }
        }
    }
}
