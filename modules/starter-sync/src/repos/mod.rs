//! Collaborators of the sync pipeline
//!
//! The handler and the batch driver only see these traits, so any storage
//! technology can stand behind them.

pub mod memory;
pub mod notification_repo;
pub mod starter_repo;

use async_trait::async_trait;
use thiserror::Error;

use crate::models::{Notification, Starter};

/// Errors shared by the store and index adapters
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Search index error: {0}")]
    Index(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Filter for listing starters; `None` fields match everything
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StarterFilter {
    pub department: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub offset: u64,
    pub limit: u32,
}

impl Page {
    pub fn first(limit: u32) -> Self {
        Self { offset: 0, limit }
    }
}

/// Read side of the system of record
#[async_trait]
pub trait StarterSource: Send + Sync {
    /// Current state of the starter keyed by `domain`; `StoreError::NotFound` if absent
    async fn find_by_key(&self, domain: &str) -> Result<Starter, StoreError>;

    /// One page of starters ordered by domain, with the total matching count
    async fn list(&self, filter: &StarterFilter, page: Page)
        -> Result<(Vec<Starter>, u64), StoreError>;
}

#[async_trait]
pub trait NotificationStore: Send + Sync {
    /// Persist a notification; saving the same id twice is a no-op
    async fn save(&self, notification: &Notification) -> Result<(), StoreError>;
}
