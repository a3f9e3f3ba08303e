use async_trait::async_trait;
use event_bus::{
    ConsumerConfig, ConsumerError, ConsumerGroupRuntime, ConsumerObserver, DeliveryOutcome,
    EventEnvelope, EventHandler, EventLog, HandlerError, InMemoryLog, OutboundRecord, Producer,
    RetryConfig, RuntimeState,
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

const GROUP: &str = "starter-sync-test";
const TOPIC: &str = "starters";

/// Records handled events; fails every attempt for keys in `failing`
#[derive(Default)]
struct RecordingHandler {
    handled: Mutex<Vec<(String, Option<String>)>>,
    attempts: Mutex<Vec<String>>,
    failing: HashSet<String>,
}

impl RecordingHandler {
    fn failing_for(keys: &[&str]) -> Self {
        Self {
            failing: keys.iter().map(|k| k.to_string()).collect(),
            ..Default::default()
        }
    }

    fn handled(&self) -> Vec<(String, Option<String>)> {
        self.handled.lock().unwrap().clone()
    }

    fn attempts_for(&self, key: &str) -> usize {
        self.attempts.lock().unwrap().iter().filter(|k| *k == key).count()
    }
}

#[async_trait]
impl EventHandler for RecordingHandler {
    async fn handle(
        &self,
        event: &EventEnvelope,
        _cancel: &CancellationToken,
    ) -> Result<(), HandlerError> {
        let key = event.key().map(str::to_string);
        self.attempts
            .lock()
            .unwrap()
            .push(key.clone().unwrap_or_default());

        if key.as_ref().is_some_and(|k| self.failing.contains(k)) {
            return Err("search index unavailable".into());
        }

        self.handled
            .lock()
            .unwrap()
            .push((event.event_type().to_string(), key));
        Ok(())
    }
}

/// Takes `delay` to handle every event, e.g. a search index that stopped answering
struct SlowHandler {
    delay: Duration,
    started: AtomicUsize,
    finished: AtomicUsize,
}

impl SlowHandler {
    fn new(delay: Duration) -> Self {
        Self {
            delay,
            started: AtomicUsize::new(0),
            finished: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl EventHandler for SlowHandler {
    async fn handle(
        &self,
        _event: &EventEnvelope,
        _cancel: &CancellationToken,
    ) -> Result<(), HandlerError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.finished.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
struct RecordingObserver {
    outcomes: Mutex<Vec<(String, DeliveryOutcome)>>,
}

impl RecordingObserver {
    fn outcomes(&self) -> Vec<DeliveryOutcome> {
        self.outcomes.lock().unwrap().iter().map(|(_, o)| *o).collect()
    }
}

impl ConsumerObserver for RecordingObserver {
    fn on_delivery(&self, topic: &str, outcome: DeliveryOutcome) {
        self.outcomes.lock().unwrap().push((topic.to_string(), outcome));
    }
}

fn fast_retry(max_retries: u32) -> RetryConfig {
    RetryConfig {
        max_retries,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(5),
        multiplier: 2.0,
        jitter: false,
    }
}

fn consumer_config() -> ConsumerConfig {
    ConsumerConfig::new(GROUP, vec![TOPIC.to_string()])
        .with_retry(fast_retry(2))
        .with_rejoin_backoff(Duration::from_millis(10))
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

async fn publish(producer: &Producer, event_type: &str, key: &str) {
    producer
        .publish(
            None,
            EventEnvelope::new(event_type).unwrap().with_key(key),
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn test_runtime_lifecycle() {
    let log = Arc::new(InMemoryLog::with_partitions(1));
    let handler = Arc::new(RecordingHandler::default());
    let runtime = ConsumerGroupRuntime::new(consumer_config(), log, handler)
        .await
        .unwrap();

    assert_eq!(runtime.state(), RuntimeState::Created);

    runtime.start().await.unwrap();
    assert_eq!(runtime.state(), RuntimeState::Running);
    assert!(matches!(runtime.start().await, Err(ConsumerError::AlreadyStarted)));

    runtime.stop().await.unwrap();
    assert_eq!(runtime.state(), RuntimeState::Stopped);

    // Idempotent stop; no restart
    runtime.stop().await.unwrap();
    assert!(matches!(runtime.start().await, Err(ConsumerError::Stopped)));
}

#[tokio::test]
async fn test_stop_without_start() {
    let log = Arc::new(InMemoryLog::new());
    let runtime = ConsumerGroupRuntime::new(
        consumer_config(),
        log,
        Arc::new(RecordingHandler::default()),
    )
    .await
    .unwrap();

    runtime.stop().await.unwrap();
    assert_eq!(runtime.state(), RuntimeState::Stopped);
}

#[tokio::test]
async fn test_invalid_config_rejected() {
    let log = Arc::new(InMemoryLog::new());
    let result = ConsumerGroupRuntime::new(
        ConsumerConfig::new("", vec![TOPIC.to_string()]),
        log,
        Arc::new(RecordingHandler::default()),
    )
    .await;

    assert!(matches!(result, Err(ConsumerError::Config(_))));
}

#[tokio::test]
async fn test_events_for_one_key_handled_in_order_and_committed() {
    let log = Arc::new(InMemoryLog::with_partitions(4));
    let producer = Producer::new(log.clone()).with_default_topic(TOPIC);
    let handler = Arc::new(RecordingHandler::default());

    let runtime = ConsumerGroupRuntime::new(consumer_config(), log.clone(), handler.clone())
        .await
        .unwrap();
    runtime.start().await.unwrap();

    publish(&producer, "insert", "alice").await;
    publish(&producer, "update", "alice").await;
    publish(&producer, "delete", "alice").await;

    wait_until(|| handler.handled().len() == 3).await;
    runtime.stop().await.unwrap();

    let types: Vec<String> = handler.handled().into_iter().map(|(t, _)| t).collect();
    assert_eq!(types, vec!["insert", "update", "delete"]);

    let partition = event_bus::partition_for("alice", 4);
    assert_eq!(log.committed_offset(GROUP, TOPIC, partition), Some(3));
}

#[tokio::test]
async fn test_malformed_message_skipped_and_committed() {
    let log = Arc::new(InMemoryLog::with_partitions(1));
    let producer = Producer::new(log.clone()).with_default_topic(TOPIC);
    let handler = Arc::new(RecordingHandler::default());
    let observer = Arc::new(RecordingObserver::default());

    let runtime = ConsumerGroupRuntime::new(consumer_config(), log.clone(), handler.clone())
        .await
        .unwrap()
        .with_observer(observer.clone());
    runtime.start().await.unwrap();

    log.append(TOPIC, OutboundRecord::new(b"not an envelope".to_vec()))
        .await
        .unwrap();
    publish(&producer, "insert", "bob").await;

    wait_until(|| handler.handled().len() == 1).await;
    runtime.stop().await.unwrap();

    assert_eq!(
        observer.outcomes(),
        vec![DeliveryOutcome::Malformed, DeliveryOutcome::Handled]
    );
    assert_eq!(log.committed_offset(GROUP, TOPIC, 0), Some(2));
}

#[tokio::test]
async fn test_exhausted_retries_commit_and_continue() {
    let log = Arc::new(InMemoryLog::with_partitions(1));
    let producer = Producer::new(log.clone()).with_default_topic(TOPIC);
    let handler = Arc::new(RecordingHandler::failing_for(&["broken"]));
    let observer = Arc::new(RecordingObserver::default());

    let runtime = ConsumerGroupRuntime::new(consumer_config(), log.clone(), handler.clone())
        .await
        .unwrap()
        .with_observer(observer.clone());
    runtime.start().await.unwrap();

    publish(&producer, "insert", "broken").await;
    publish(&producer, "insert", "carol").await;

    wait_until(|| handler.handled().len() == 1).await;
    runtime.stop().await.unwrap();

    // max_retries = 2 means three attempts
    assert_eq!(handler.attempts_for("broken"), 3);
    assert_eq!(
        observer.outcomes(),
        vec![DeliveryOutcome::Failed, DeliveryOutcome::Handled]
    );
    assert_eq!(log.committed_offset(GROUP, TOPIC, 0), Some(2));
}

#[tokio::test]
async fn test_exhausted_event_republished_to_dead_letter_topic() {
    let log = Arc::new(InMemoryLog::with_partitions(1));
    let producer = Producer::new(log.clone()).with_default_topic(TOPIC);
    let handler = Arc::new(RecordingHandler::failing_for(&["broken"]));
    let observer = Arc::new(RecordingObserver::default());

    let config = consumer_config().with_dead_letter_topic("starters-dlq");
    let runtime = ConsumerGroupRuntime::new(config, log.clone(), handler.clone())
        .await
        .unwrap()
        .with_observer(observer.clone());
    runtime.start().await.unwrap();

    publish(&producer, "update", "broken").await;

    wait_until(|| log.len("starters-dlq") == 1).await;
    wait_until(|| observer.outcomes().len() == 1).await;
    runtime.stop().await.unwrap();

    assert_eq!(observer.outcomes(), vec![DeliveryOutcome::DeadLettered]);

    // Read the dead letter back through a separate group
    let inspector = Arc::new(RecordingHandler::default());
    let reader = ConsumerGroupRuntime::new(
        ConsumerConfig::new("dlq-inspector", vec!["starters-dlq".to_string()]),
        log.clone(),
        inspector.clone(),
    )
    .await
    .unwrap();
    reader.start().await.unwrap();
    wait_until(|| inspector.handled().len() == 1).await;
    reader.stop().await.unwrap();

    assert_eq!(
        inspector.handled(),
        vec![("update".to_string(), Some("broken".to_string()))]
    );
}

#[tokio::test]
async fn test_runtime_rejoins_after_rebalance() {
    let log = Arc::new(InMemoryLog::with_partitions(2));
    let producer = Producer::new(log.clone()).with_default_topic(TOPIC);
    let handler = Arc::new(RecordingHandler::default());

    let runtime = ConsumerGroupRuntime::new(consumer_config(), log.clone(), handler.clone())
        .await
        .unwrap();
    runtime.start().await.unwrap();

    publish(&producer, "insert", "alice").await;
    wait_until(|| handler.handled().len() == 1).await;

    log.rebalance(GROUP);

    publish(&producer, "update", "alice").await;
    wait_until(|| handler.handled().len() == 2).await;
    runtime.stop().await.unwrap();

    // Committed work is not redelivered by the new generation
    assert_eq!(
        handler.handled(),
        vec![
            ("insert".to_string(), Some("alice".to_string())),
            ("update".to_string(), Some("alice".to_string())),
        ]
    );
}

#[tokio::test]
async fn test_shutdown_leaves_interrupted_message_uncommitted() {
    let log = Arc::new(InMemoryLog::with_partitions(1));
    let producer = Producer::new(log.clone()).with_default_topic(TOPIC);
    let failing = Arc::new(RecordingHandler::failing_for(&["dave"]));
    let observer = Arc::new(RecordingObserver::default());

    let slow_retry = RetryConfig {
        initial_backoff: Duration::from_secs(30),
        max_backoff: Duration::from_secs(30),
        jitter: false,
        ..RetryConfig::default()
    };
    let runtime = ConsumerGroupRuntime::new(
        consumer_config().with_retry(slow_retry),
        log.clone(),
        failing.clone(),
    )
    .await
    .unwrap()
    .with_observer(observer.clone());
    runtime.start().await.unwrap();

    publish(&producer, "insert", "dave").await;
    wait_until(|| failing.attempts_for("dave") == 1).await;

    // Stop lands in the backoff sleep
    tokio::time::timeout(Duration::from_secs(5), runtime.stop())
        .await
        .expect("stop should not wait out the backoff")
        .unwrap();

    assert_eq!(observer.outcomes(), vec![DeliveryOutcome::Interrupted]);
    assert_eq!(log.committed_offset(GROUP, TOPIC, 0), Some(0));

    // The next member of the group picks the message up again
    let healthy = Arc::new(RecordingHandler::default());
    let successor = ConsumerGroupRuntime::new(consumer_config(), log.clone(), healthy.clone())
        .await
        .unwrap();
    successor.start().await.unwrap();
    wait_until(|| healthy.handled().len() == 1).await;
    successor.stop().await.unwrap();

    assert_eq!(log.committed_offset(GROUP, TOPIC, 0), Some(1));
}

#[tokio::test]
async fn test_stop_interrupts_handler_stuck_mid_call() {
    let log = Arc::new(InMemoryLog::with_partitions(1));
    let producer = Producer::new(log.clone()).with_default_topic(TOPIC);
    let stuck = Arc::new(SlowHandler::new(Duration::from_secs(30)));
    let observer = Arc::new(RecordingObserver::default());

    let runtime = ConsumerGroupRuntime::new(consumer_config(), log.clone(), stuck.clone())
        .await
        .unwrap()
        .with_observer(observer.clone());
    runtime.start().await.unwrap();

    publish(&producer, "insert", "erin").await;
    wait_until(|| stuck.started.load(Ordering::SeqCst) == 1).await;

    let stopping = Instant::now();
    tokio::time::timeout(Duration::from_secs(2), runtime.stop())
        .await
        .expect("stop should not wait for the handler to return")
        .unwrap();

    assert!(stopping.elapsed() < Duration::from_secs(1));
    assert_eq!(runtime.state(), RuntimeState::Stopped);
    assert_eq!(stuck.finished.load(Ordering::SeqCst), 0);
    assert_eq!(observer.outcomes(), vec![DeliveryOutcome::Interrupted]);
    assert_eq!(log.committed_offset(GROUP, TOPIC, 0), Some(0));
}

#[tokio::test]
async fn test_slow_delivery_kept_alive_until_handled() {
    let log = Arc::new(InMemoryLog::with_partitions(1));
    let producer = Producer::new(log.clone()).with_default_topic(TOPIC);
    let slow = Arc::new(SlowHandler::new(Duration::from_millis(200)));

    let mut config = consumer_config();
    config.session_timeout = Duration::from_millis(100);
    config.heartbeat_interval = Duration::from_millis(20);
    let runtime = ConsumerGroupRuntime::new(config, log.clone(), slow.clone())
        .await
        .unwrap();
    runtime.start().await.unwrap();

    publish(&producer, "update", "frank").await;
    wait_until(|| slow.finished.load(Ordering::SeqCst) == 1).await;
    wait_until(|| log.committed_offset(GROUP, TOPIC, 0) == Some(1)).await;
    runtime.stop().await.unwrap();

    // 200ms of handling at a 20ms heartbeat
    assert!(log.keep_alives(GROUP) >= 3, "keep-alives: {}", log.keep_alives(GROUP));
}

#[tokio::test]
async fn test_fast_delivery_sends_no_keep_alive() {
    let log = Arc::new(InMemoryLog::with_partitions(1));
    let producer = Producer::new(log.clone()).with_default_topic(TOPIC);
    let handler = Arc::new(RecordingHandler::default());

    let runtime = ConsumerGroupRuntime::new(consumer_config(), log.clone(), handler.clone())
        .await
        .unwrap();
    runtime.start().await.unwrap();

    publish(&producer, "insert", "grace").await;
    wait_until(|| handler.handled().len() == 1).await;
    runtime.stop().await.unwrap();

    assert_eq!(log.keep_alives(GROUP), 0);
}
