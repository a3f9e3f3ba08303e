use event_bus::{ConsumerObserver, DeliveryOutcome};
use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

#[derive(Clone)]
pub struct SyncMetrics {
    registry: Registry,

    pub sync_events_total: IntCounterVec,
    pub sync_reindex_documents_total: IntCounter,
}

impl SyncMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let sync_events_total = IntCounterVec::new(
            Opts::new("sync_events_total", "Consumed sync events by outcome"),
            &["topic", "outcome"], // handled|failed|malformed|dead_lettered|interrupted
        )?;

        let sync_reindex_documents_total = IntCounter::new(
            "sync_reindex_documents_total",
            "Documents written by the reindex batch driver",
        )?;

        registry.register(Box::new(sync_events_total.clone()))?;
        registry.register(Box::new(sync_reindex_documents_total.clone()))?;

        Ok(Self {
            registry,
            sync_events_total,
            sync_reindex_documents_total,
        })
    }

    pub fn render(&self) -> Result<String, String> {
        let encoder = TextEncoder::new();
        let mf = self.registry.gather();
        let mut buf = Vec::new();
        encoder.encode(&mf, &mut buf).map_err(|e| e.to_string())?;
        String::from_utf8(buf).map_err(|e| e.to_string())
    }
}

impl ConsumerObserver for SyncMetrics {
    fn on_delivery(&self, topic: &str, outcome: DeliveryOutcome) {
        self.sync_events_total
            .with_label_values(&[topic, outcome.as_str()])
            .inc();
    }
}
