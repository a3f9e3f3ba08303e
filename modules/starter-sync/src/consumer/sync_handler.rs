//! Sync Handler
//!
//! Routes each event by type to an idempotent side effect:
//! - `insert` / `update` / `index`: re-read the starter from the system of
//!   record and upsert it into the search index. The event payload is only a
//!   hint; a delayed or retried message must never index stale data.
//! - `delete`: remove the starter from the index (absence is fine).
//! - `notification-leader-assignment`: store the notification.
//! - anything else: logged and acknowledged.
//!
//! Persistence failures are returned so the consumer runtime retries them;
//! the handler itself never retries.

use async_trait::async_trait;
use event_bus::{EventEnvelope, EventHandler, HandlerError};
use serde::Deserialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::events::{EventRoute, StarterEventKind};
use crate::models::{LeaderAssignmentNotification, StarterDocument};
use crate::repos::{NotificationStore, StarterSource, StoreError};
use crate::search::SearchIndex;

/// The only payload field the handler looks at for starter events
#[derive(Debug, Deserialize)]
struct StarterHint {
    domain: Option<String>,
}

pub struct SyncHandler {
    source: Arc<dyn StarterSource>,
    index: Arc<dyn SearchIndex>,
    notifications: Arc<dyn NotificationStore>,
}

impl SyncHandler {
    pub fn new(
        source: Arc<dyn StarterSource>,
        index: Arc<dyn SearchIndex>,
        notifications: Arc<dyn NotificationStore>,
    ) -> Self {
        Self {
            source,
            index,
            notifications,
        }
    }

    /// Entity key: envelope key, else envelope domain, else the payload's domain
    fn entity_key(event: &EventEnvelope) -> Option<String> {
        if let Some(key) = event.routing_key() {
            return Some(key.to_string());
        }

        event
            .decode_payload::<StarterHint>()
            .ok()
            .flatten()
            .and_then(|hint| hint.domain)
            .filter(|domain| !domain.trim().is_empty())
    }

    async fn sync_starter(
        &self,
        event: &EventEnvelope,
        kind: StarterEventKind,
    ) -> Result<(), StoreError> {
        let Some(domain) = Self::entity_key(event) else {
            tracing::warn!(
                event_type = %event.event_type(),
                "Starter event carries no entity key, skipping"
            );
            return Ok(());
        };

        match kind {
            StarterEventKind::Delete => {
                self.index.delete(&domain).await?;
                tracing::info!(domain = %domain, "Starter removed from index");
            }
            StarterEventKind::Insert | StarterEventKind::Update | StarterEventKind::Index => {
                match self.source.find_by_key(&domain).await {
                    Ok(starter) => {
                        self.index.upsert(&StarterDocument::from(&starter)).await?;
                        tracing::info!(
                            domain = %domain,
                            event_type = %kind.as_str(),
                            "Starter indexed"
                        );
                    }
                    Err(StoreError::NotFound(_)) => {
                        // Deleted since the event was produced
                        self.index.delete(&domain).await?;
                        tracing::info!(
                            domain = %domain,
                            "Starter no longer exists, removed from index"
                        );
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        Ok(())
    }

    async fn store_leader_assignment(&self, event: &EventEnvelope) -> Result<(), StoreError> {
        let payload = match event.decode_payload::<LeaderAssignmentNotification>() {
            Ok(Some(payload)) => payload,
            Ok(None) => {
                tracing::warn!("Leader assignment event without payload, skipping");
                return Ok(());
            }
            Err(e) => {
                tracing::warn!(error = %e, "Malformed leader assignment payload, skipping");
                return Ok(());
            }
        };

        let notification = payload.into_notification(event.timestamp());
        self.notifications.save(&notification).await?;

        tracing::info!(
            notification_id = %notification.id,
            recipient = %notification.recipient,
            department = %notification.department,
            "Leader assignment notification stored"
        );
        Ok(())
    }
}

#[async_trait]
impl EventHandler for SyncHandler {
    async fn handle(
        &self,
        event: &EventEnvelope,
        _cancel: &CancellationToken,
    ) -> Result<(), HandlerError> {
        match EventRoute::from_type(event.event_type()) {
            EventRoute::Starter(kind) => self.sync_starter(event, kind).await?,
            EventRoute::LeaderAssignment => self.store_leader_assignment(event).await?,
            EventRoute::Unknown => {
                tracing::info!(
                    event_type = %event.event_type(),
                    "Ignoring event of unknown type"
                );
            }
        }
        Ok(())
    }
}
