//! Startup ordering
//!
//! The cold-start reindex writes a snapshot of the system of record. Events
//! already queued on the log describe changes the snapshot may predate, so
//! they are only applied once the snapshot is written. Consuming first would
//! let a late snapshot page overwrite a delete.

use event_bus::{ConsumerError, ConsumerGroupRuntime};
use tokio_util::sync::CancellationToken;

use crate::metrics::SyncMetrics;
use crate::services::reindex_service::{ReindexError, ReindexService};

/// Reindex an empty search index, then start consuming
///
/// A failed reindex is logged and consumption starts anyway; the events
/// converge the index. Returns `Ok(false)` when `cancel` fires before the
/// runtime is running, in which case nothing was consumed.
pub async fn catch_up_then_consume(
    reindex: &ReindexService,
    runtime: &ConsumerGroupRuntime,
    metrics: &SyncMetrics,
    cancel: &CancellationToken,
) -> Result<bool, ConsumerError> {
    match reindex.reindex_if_empty(cancel).await {
        Ok(Some(report)) => {
            metrics.sync_reindex_documents_total.inc_by(report.documents);
        }
        Ok(None) => {}
        Err(ReindexError::Cancelled { documents }) => {
            metrics.sync_reindex_documents_total.inc_by(documents);
            tracing::info!(documents, "Shutdown during reindex, not starting consumer");
            return Ok(false);
        }
        Err(e) => {
            tracing::error!(error = %e, "Reindex failed, relying on sync events to converge");
        }
    }

    if cancel.is_cancelled() {
        return Ok(false);
    }

    tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            tracing::info!("Shutdown while joining the consumer group");
            Ok(false)
        }
        started = runtime.start() => started.map(|()| true),
    }
}
