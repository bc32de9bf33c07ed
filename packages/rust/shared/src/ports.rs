//! Collaborator interfaces consumed by the pipeline core.
//!
//! The core only talks to queues, blob storage and the document store
//! through these traits. `docpipe-storage` provides the libSQL-backed and
//! in-memory implementations.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Result;

/// A message leased from a queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueMessage {
    /// Stable message identifier.
    pub id: String,
    /// Receipt of the current lease; required to delete the message.
    pub pop_receipt: String,
    /// Message payload (pipeline JSON).
    pub body: String,
    /// How many times the message has been received, including this one.
    pub dequeue_count: u32,
    /// When the message was first enqueued.
    pub inserted_at: DateTime<Utc>,
}

/// Obtains queue clients by name.
#[async_trait]
pub trait QueueService: Send + Sync {
    /// Return a client for `name`, creating the queue if it does not exist.
    async fn create_or_get(&self, name: &str) -> Result<Arc<dyn QueueClient>>;
}

/// Operations on one named queue.
#[async_trait]
pub trait QueueClient: Send + Sync {
    fn name(&self) -> &str;

    /// Lease at most one visible message, hiding it for `visibility_timeout`.
    async fn receive(&self, visibility_timeout: Duration) -> Result<Option<QueueMessage>>;

    /// Delete a leased message. Fails if the lease has been lost.
    async fn delete(&self, message: &QueueMessage) -> Result<()>;

    /// Append a message. Returns the new message id.
    async fn enqueue(&self, payload: &str) -> Result<String>;

    async fn approximate_message_count(&self) -> Result<u64>;
}

/// Blob-like storage addressed by (container, blob name).
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Write `data`, replacing any previous blob. Returns the stored size in bytes.
    async fn upload(&self, container: &str, blob_name: &str, data: &[u8]) -> Result<u64>;

    /// Read a blob. Fails with `NotFound` when absent.
    async fn download(&self, container: &str, blob_name: &str) -> Result<Vec<u8>>;

    async fn exists(&self, container: &str, blob_name: &str) -> Result<bool>;

    /// Convenience wrapper for UTF-8 text.
    async fn upload_text(&self, container: &str, blob_name: &str, text: &str) -> Result<u64> {
        self.upload(container, blob_name, text.as_bytes()).await
    }
}

/// JSON document store with top-level field-equality filters.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn find(&self, collection: &str, filter: &Map<String, Value>) -> Result<Vec<Value>>;

    async fn insert(&self, collection: &str, document: &Value) -> Result<()>;

    /// Replace every document matching `filter`. Returns the number replaced.
    async fn update(
        &self,
        collection: &str,
        filter: &Map<String, Value>,
        document: &Value,
    ) -> Result<u64>;
}

/// Whether `document` matches every field of `filter`.
pub fn matches_filter(document: &Value, filter: &Map<String, Value>) -> bool {
    filter
        .iter()
        .all(|(key, expected)| document.get(key) == Some(expected))
}
