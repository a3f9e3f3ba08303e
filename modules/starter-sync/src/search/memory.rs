use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use super::SearchIndex;
use crate::models::StarterDocument;
use crate::repos::memory::{lock, FailureInjector};
use crate::repos::StoreError;

/// Search index kept in process memory
#[derive(Debug, Default)]
pub struct InMemorySearchIndex {
    documents: Mutex<BTreeMap<String, StarterDocument>>,
    bulk_calls: AtomicUsize,
    failures: FailureInjector,
}

impl InMemorySearchIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `times` write or count calls with `StoreError::Index`
    pub fn fail_next(&self, times: u32) {
        self.failures.arm(times);
    }

    pub fn get(&self, id: &str) -> Option<StarterDocument> {
        lock(&self.documents).get(id).cloned()
    }

    pub fn len(&self) -> usize {
        lock(&self.documents).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn bulk_calls(&self) -> usize {
        self.bulk_calls.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.failures.trip() {
            return Err(StoreError::Index("injected failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl SearchIndex for InMemorySearchIndex {
    async fn upsert(&self, document: &StarterDocument) -> Result<(), StoreError> {
        self.check()?;
        lock(&self.documents).insert(document.id().to_string(), document.clone());
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        self.check()?;
        lock(&self.documents).remove(id);
        Ok(())
    }

    async fn bulk_upsert(&self, documents: &[StarterDocument]) -> Result<(), StoreError> {
        self.bulk_calls.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        let mut stored = lock(&self.documents);
        for document in documents {
            stored.insert(document.id().to_string(), document.clone());
        }
        Ok(())
    }

    async fn count_all(&self) -> Result<u64, StoreError> {
        self.check()?;
        Ok(self.len() as u64)
    }
}
