//! Reindex-All Batch Driver
//!
//! Cold-start catch-up: pages through the system of record and bulk-loads the
//! search index. Aborting half way is safe because every document written is
//! the current state, and later sync events converge whatever is missing.

use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::models::StarterDocument;
use crate::repos::{Page, StarterFilter, StarterSource, StoreError};
use crate::search::SearchIndex;

pub const DEFAULT_BATCH_SIZE: u32 = 100;

#[derive(Debug, Error)]
pub enum ReindexError {
    #[error("reading starters failed: {0}")]
    Source(#[source] StoreError),

    #[error("writing to the search index failed: {0}")]
    Index(#[source] StoreError),

    #[error("reindex cancelled after {documents} documents")]
    Cancelled { documents: u64 },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReindexReport {
    /// Page reads issued against the system of record
    pub pages: u64,
    /// Documents written to the index
    pub documents: u64,
    /// Total reported by the system of record on the last page
    pub total: u64,
}

pub struct ReindexService {
    source: Arc<dyn StarterSource>,
    index: Arc<dyn SearchIndex>,
    batch_size: u32,
}

impl ReindexService {
    /// A `batch_size` of zero falls back to [`DEFAULT_BATCH_SIZE`]
    pub fn new(
        source: Arc<dyn StarterSource>,
        index: Arc<dyn SearchIndex>,
        batch_size: u32,
    ) -> Self {
        let batch_size = if batch_size == 0 {
            DEFAULT_BATCH_SIZE
        } else {
            batch_size
        };
        Self {
            source,
            index,
            batch_size,
        }
    }

    pub fn batch_size(&self) -> u32 {
        self.batch_size
    }

    /// Copy every starter into the index, one page per bulk request
    ///
    /// Stops when the running count reaches the reported total or a page
    /// comes back empty. Cancellation is checked between pages.
    pub async fn reindex_all(
        &self,
        cancel: &CancellationToken,
    ) -> Result<ReindexReport, ReindexError> {
        let filter = StarterFilter::default();
        let mut report = ReindexReport::default();

        loop {
            if cancel.is_cancelled() {
                return Err(ReindexError::Cancelled {
                    documents: report.documents,
                });
            }

            let page = Page {
                offset: report.documents,
                limit: self.batch_size,
            };
            let (starters, total) = self
                .source
                .list(&filter, page)
                .await
                .map_err(ReindexError::Source)?;
            report.pages += 1;
            report.total = total;

            if starters.is_empty() {
                break;
            }

            let documents: Vec<StarterDocument> =
                starters.iter().map(StarterDocument::from).collect();
            self.index
                .bulk_upsert(&documents)
                .await
                .map_err(ReindexError::Index)?;
            report.documents += documents.len() as u64;

            tracing::debug!(
                page = report.pages,
                documents = report.documents,
                total = total,
                "Reindex page written"
            );

            if report.documents >= total {
                break;
            }
        }

        tracing::info!(
            pages = report.pages,
            documents = report.documents,
            "Reindex completed"
        );
        Ok(report)
    }

    /// Run [`reindex_all`](Self::reindex_all) only when the index holds no documents
    pub async fn reindex_if_empty(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Option<ReindexReport>, ReindexError> {
        let existing = self.index.count_all().await.map_err(ReindexError::Index)?;
        if existing > 0 {
            tracing::info!(documents = existing, "Search index populated, skipping reindex");
            return Ok(None);
        }

        tracing::info!(batch_size = self.batch_size, "Search index empty, reindexing");
        self.reindex_all(cancel).await.map(Some)
    }
}
