pub mod elastic;
pub mod memory;

pub use elastic::ElasticsearchIndex;
pub use memory::InMemorySearchIndex;

use async_trait::async_trait;

use crate::models::StarterDocument;
use crate::repos::StoreError;

/// Write side of the starter search index
///
/// Every operation must be idempotent: the consumer may apply the same event
/// more than once.
#[async_trait]
pub trait SearchIndex: Send + Sync {
    async fn upsert(&self, document: &StarterDocument) -> Result<(), StoreError>;

    /// Remove a document; a missing document is not an error
    async fn delete(&self, id: &str) -> Result<(), StoreError>;

    async fn bulk_upsert(&self, documents: &[StarterDocument]) -> Result<(), StoreError>;

    async fn count_all(&self) -> Result<u64, StoreError>;
}
