//! Elasticsearch adapter over its REST API

use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use std::time::Duration;

use super::SearchIndex;
use crate::models::StarterDocument;
use crate::repos::StoreError;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct ElasticsearchIndex {
    client: Client,
    base_url: Url,
    index: String,
}

#[derive(Debug, Deserialize)]
struct CountResponse {
    count: u64,
}

#[derive(Debug, Deserialize)]
struct BulkResponse {
    errors: bool,
    #[serde(default)]
    items: Vec<serde_json::Value>,
}

impl ElasticsearchIndex {
    pub fn new(base_url: &str, index: impl Into<String>) -> Result<Self, StoreError> {
        let base_url = Url::parse(base_url)
            .map_err(|e| StoreError::Index(format!("invalid Elasticsearch URL {}: {}", base_url, e)))?;
        let index = index.into();
        if index.trim().is_empty() {
            return Err(StoreError::Index("index name must not be empty".to_string()));
        }

        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| StoreError::Index(e.to_string()))?;

        Ok(Self {
            client,
            base_url,
            index,
        })
    }

    pub fn index_name(&self) -> &str {
        &self.index
    }

    /// `base_url` joined with percent-encoded path segments
    fn url(&self, segments: &[&str]) -> Result<Url, StoreError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| StoreError::Index(format!("{} cannot be a base URL", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn document_url(&self, id: &str) -> Result<Url, StoreError> {
        self.url(&[self.index.as_str(), "_doc", id])
    }
}

/// NDJSON body for the `_bulk` API: one action line and one source line per document
fn bulk_body(index: &str, documents: &[StarterDocument]) -> Result<String, StoreError> {
    let mut body = String::new();
    for document in documents {
        let action = serde_json::json!({ "index": { "_index": index, "_id": document.id() } });
        body.push_str(&action.to_string());
        body.push('\n');
        let source =
            serde_json::to_string(document).map_err(|e| StoreError::Index(e.to_string()))?;
        body.push_str(&source);
        body.push('\n');
    }
    Ok(body)
}

/// First item-level error reported by a `_bulk` response
fn first_bulk_error(response: &BulkResponse) -> Option<String> {
    response.items.iter().find_map(|item| {
        item.as_object()
            .and_then(|actions| actions.values().next())
            .and_then(|result| result.get("error"))
            .map(|error| error.to_string())
    })
}

fn status_error(operation: &str, status: StatusCode) -> StoreError {
    StoreError::Index(format!("{} failed with HTTP {}", operation, status))
}

fn transport_error(operation: &str, error: reqwest::Error) -> StoreError {
    StoreError::Unavailable(format!("{}: {}", operation, error))
}

#[async_trait]
impl SearchIndex for ElasticsearchIndex {
    async fn upsert(&self, document: &StarterDocument) -> Result<(), StoreError> {
        let response = self
            .client
            .put(self.document_url(document.id())?)
            .json(document)
            .send()
            .await
            .map_err(|e| transport_error("upsert", e))?;

        if !response.status().is_success() {
            return Err(status_error("upsert", response.status()));
        }
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        let response = self
            .client
            .delete(self.document_url(id)?)
            .send()
            .await
            .map_err(|e| transport_error("delete", e))?;

        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND => {
                tracing::debug!(id = %id, "Document already absent from index");
                Ok(())
            }
            status => Err(status_error("delete", status)),
        }
    }

    async fn bulk_upsert(&self, documents: &[StarterDocument]) -> Result<(), StoreError> {
        if documents.is_empty() {
            return Ok(());
        }

        let response = self
            .client
            .post(self.url(&["_bulk"])?)
            .header(reqwest::header::CONTENT_TYPE, "application/x-ndjson")
            .body(bulk_body(&self.index, documents)?)
            .send()
            .await
            .map_err(|e| transport_error("bulk", e))?;

        if !response.status().is_success() {
            return Err(status_error("bulk", response.status()));
        }

        let result: BulkResponse = response
            .json()
            .await
            .map_err(|e| StoreError::Index(format!("bulk response: {}", e)))?;
        if result.errors {
            let reason = first_bulk_error(&result).unwrap_or_else(|| "unknown".to_string());
            return Err(StoreError::Index(format!("bulk item failed: {}", reason)));
        }
        Ok(())
    }

    async fn count_all(&self) -> Result<u64, StoreError> {
        let response = self
            .client
            .get(self.url(&[self.index.as_str(), "_count"])?)
            .send()
            .await
            .map_err(|e| transport_error("count", e))?;

        match response.status() {
            // Index not created yet
            StatusCode::NOT_FOUND => Ok(0),
            status if status.is_success() => {
                let body: CountResponse = response
                    .json()
                    .await
                    .map_err(|e| StoreError::Index(format!("count response: {}", e)))?;
                Ok(body.count)
            }
            status => Err(status_error("count", status)),
        }
    }
}
