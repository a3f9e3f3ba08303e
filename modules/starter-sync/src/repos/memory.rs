//! In-memory collaborators for tests and local development
//!
//! Each one counts its calls and can be told to fail the next N calls, which
//! is how the retry path is exercised without a real database.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::{NotificationStore, Page, StarterFilter, StarterSource, StoreError};
use crate::models::{Notification, Starter};

/// Countdown of injected failures
#[derive(Debug, Default)]
pub(crate) struct FailureInjector {
    remaining: AtomicU32,
}

impl FailureInjector {
    pub(crate) fn arm(&self, times: u32) {
        self.remaining.store(times, Ordering::SeqCst);
    }

    /// `true` if this call should fail
    pub(crate) fn trip(&self) -> bool {
        self.remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Default)]
pub struct InMemoryStarterSource {
    starters: Mutex<BTreeMap<String, Starter>>,
    find_calls: AtomicUsize,
    list_calls: AtomicUsize,
    failures: FailureInjector,
}

impl InMemoryStarterSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_starters(starters: impl IntoIterator<Item = Starter>) -> Self {
        let source = Self::new();
        for starter in starters {
            source.put(starter);
        }
        source
    }

    /// Insert or replace a starter
    pub fn put(&self, starter: Starter) {
        lock(&self.starters).insert(starter.domain.clone(), starter);
    }

    pub fn remove(&self, domain: &str) -> Option<Starter> {
        lock(&self.starters).remove(domain)
    }

    /// Fail the next `times` calls with `StoreError::Unavailable`
    pub fn fail_next(&self, times: u32) {
        self.failures.arm(times);
    }

    pub fn find_calls(&self) -> usize {
        self.find_calls.load(Ordering::SeqCst)
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StarterSource for InMemoryStarterSource {
    async fn find_by_key(&self, domain: &str) -> Result<Starter, StoreError> {
        self.find_calls.fetch_add(1, Ordering::SeqCst);
        if self.failures.trip() {
            return Err(StoreError::Unavailable("injected failure".to_string()));
        }

        lock(&self.starters)
            .get(domain)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("starter {}", domain)))
    }

    async fn list(
        &self,
        filter: &StarterFilter,
        page: Page,
    ) -> Result<(Vec<Starter>, u64), StoreError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if self.failures.trip() {
            return Err(StoreError::Unavailable("injected failure".to_string()));
        }

        let starters = lock(&self.starters);
        let matching: Vec<&Starter> = starters
            .values()
            .filter(|s| {
                filter
                    .department
                    .as_ref()
                    .map_or(true, |department| s.department == *department)
            })
            .collect();

        let total = matching.len() as u64;
        let rows = matching
            .into_iter()
            .skip(page.offset as usize)
            .take(page.limit as usize)
            .cloned()
            .collect();

        Ok((rows, total))
    }
}

#[derive(Debug, Default)]
pub struct InMemoryNotificationStore {
    notifications: Mutex<BTreeMap<uuid::Uuid, Notification>>,
    save_calls: AtomicUsize,
    failures: FailureInjector,
}

impl InMemoryNotificationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, times: u32) {
        self.failures.arm(times);
    }

    pub fn save_calls(&self) -> usize {
        self.save_calls.load(Ordering::SeqCst)
    }

    pub fn all(&self) -> Vec<Notification> {
        lock(&self.notifications).values().cloned().collect()
    }

    pub fn for_recipient(&self, recipient: &str) -> Vec<Notification> {
        lock(&self.notifications)
            .values()
            .filter(|n| n.recipient == recipient)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl NotificationStore for InMemoryNotificationStore {
    async fn save(&self, notification: &Notification) -> Result<(), StoreError> {
        self.save_calls.fetch_add(1, Ordering::SeqCst);
        if self.failures.trip() {
            return Err(StoreError::Unavailable("injected failure".to_string()));
        }

        lock(&self.notifications)
            .entry(notification.id)
            .or_insert_with(|| notification.clone());
        Ok(())
    }
}
