//! In-process collaborator backend.
//!
//! Mirrors the lease semantics of the libSQL queues so handler tests and
//! single-process runs behave the same as the shared database.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use docpipe_shared::{
    AppConfig, BlobStore, DocPipeError, DocumentStore, ProcessContext, QueueClient, QueueMessage,
    QueueService, Result, matches_filter,
};
use serde_json::{Map, Value};
use uuid::Uuid;

#[derive(Debug, Clone)]
struct StoredMessage {
    id: String,
    body: String,
    dequeue_count: u32,
    pop_receipt: Option<String>,
    visible_at: DateTime<Utc>,
    inserted_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct State {
    queues: HashMap<String, VecDeque<StoredMessage>>,
    blobs: BTreeMap<(String, String), Vec<u8>>,
    documents: HashMap<String, Vec<Value>>,
}

/// Queues, blobs and documents held in memory. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    state: Arc<Mutex<State>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| DocPipeError::Storage("memory backend lock poisoned".into()))
    }

    /// Assemble a [`ProcessContext`] backed entirely by this instance.
    pub fn process_context(&self, configuration: AppConfig) -> ProcessContext {
        let shared = Arc::new(self.clone());
        ProcessContext::new(
            configuration,
            None,
            shared.clone() as Arc<dyn QueueService>,
            shared.clone() as Arc<dyn BlobStore>,
            shared as Arc<dyn DocumentStore>,
        )
    }

    /// Bodies of every message in `queue`, leased or not, oldest first.
    pub fn peek_all(&self, queue: &str) -> Result<Vec<String>> {
        let state = self.lock()?;
        Ok(state
            .queues
            .get(queue)
            .map(|q| q.iter().map(|m| m.body.clone()).collect())
            .unwrap_or_default())
    }

    /// Names of queues created so far.
    pub fn queue_names(&self) -> Result<Vec<String>> {
        let state = self.lock()?;
        let mut names: Vec<String> = state.queues.keys().cloned().collect();
        names.sort();
        Ok(names)
    }
}

#[async_trait]
impl QueueService for MemoryBackend {
    async fn create_or_get(&self, name: &str) -> Result<Arc<dyn QueueClient>> {
        self.lock()?.queues.entry(name.to_string()).or_default();
        Ok(Arc::new(MemoryQueue {
            backend: self.clone(),
            name: name.to_string(),
        }))
    }
}

/// One named queue inside a [`MemoryBackend`].
pub struct MemoryQueue {
    backend: MemoryBackend,
    name: String,
}

#[async_trait]
impl QueueClient for MemoryQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn receive(&self, visibility_timeout: Duration) -> Result<Option<QueueMessage>> {
        let now = Utc::now();
        let lease = chrono::Duration::from_std(visibility_timeout)
            .map_err(|e| DocPipeError::Queue(format!("invalid visibility timeout: {e}")))?;

        let mut state = self.backend.lock()?;
        let Some(queue) = state.queues.get_mut(&self.name) else {
            return Ok(None);
        };
        let Some(stored) = queue.iter_mut().find(|m| m.visible_at <= now) else {
            return Ok(None);
        };

        let receipt = Uuid::now_v7().to_string();
        stored.dequeue_count += 1;
        stored.pop_receipt = Some(receipt.clone());
        stored.visible_at = now + lease;

        Ok(Some(QueueMessage {
            id: stored.id.clone(),
            pop_receipt: receipt,
            body: stored.body.clone(),
            dequeue_count: stored.dequeue_count,
            inserted_at: stored.inserted_at,
        }))
    }

    async fn delete(&self, message: &QueueMessage) -> Result<()> {
        let mut state = self.backend.lock()?;
        let queue = state
            .queues
            .get_mut(&self.name)
            .ok_or_else(|| DocPipeError::Queue(format!("queue {} does not exist", self.name)))?;

        let position = queue.iter().position(|m| {
            m.id == message.id && m.pop_receipt.as_deref() == Some(message.pop_receipt.as_str())
        });
        match position {
            Some(index) => {
                queue.remove(index);
                Ok(())
            }
            None => Err(DocPipeError::Queue(format!(
                "message {} in {} is no longer leased by this receiver",
                message.id, self.name
            ))),
        }
    }

    async fn enqueue(&self, payload: &str) -> Result<String> {
        let id = Uuid::now_v7().to_string();
        let now = Utc::now();
        let mut state = self.backend.lock()?;
        state
            .queues
            .entry(self.name.clone())
            .or_default()
            .push_back(StoredMessage {
                id: id.clone(),
                body: payload.to_string(),
                dequeue_count: 0,
                pop_receipt: None,
                visible_at: now,
                inserted_at: now,
            });
        Ok(id)
    }

    async fn approximate_message_count(&self) -> Result<u64> {
        let state = self.backend.lock()?;
        Ok(state.queues.get(&self.name).map_or(0, |q| q.len() as u64))
    }
}

#[async_trait]
impl BlobStore for MemoryBackend {
    async fn upload(&self, container: &str, blob_name: &str, data: &[u8]) -> Result<u64> {
        self.lock()?
            .blobs
            .insert((container.to_string(), blob_name.to_string()), data.to_vec());
        Ok(data.len() as u64)
    }

    async fn download(&self, container: &str, blob_name: &str) -> Result<Vec<u8>> {
        self.lock()?
            .blobs
            .get(&(container.to_string(), blob_name.to_string()))
            .cloned()
            .ok_or_else(|| DocPipeError::not_found(format!("blob {container}/{blob_name}")))
    }

    async fn exists(&self, container: &str, blob_name: &str) -> Result<bool> {
        Ok(self
            .lock()?
            .blobs
            .contains_key(&(container.to_string(), blob_name.to_string())))
    }
}

#[async_trait]
impl DocumentStore for MemoryBackend {
    async fn find(&self, collection: &str, filter: &Map<String, Value>) -> Result<Vec<Value>> {
        let state = self.lock()?;
        Ok(state
            .documents
            .get(collection)
            .map(|docs| {
                docs.iter()
                    .filter(|doc| matches_filter(doc, filter))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn insert(&self, collection: &str, document: &Value) -> Result<()> {
        self.lock()?
            .documents
            .entry(collection.to_string())
            .or_default()
            .push(document.clone());
        Ok(())
    }

    async fn update(
        &self,
        collection: &str,
        filter: &Map<String, Value>,
        document: &Value,
    ) -> Result<u64> {
        let mut state = self.lock()?;
        let mut updated = 0;
        if let Some(docs) = state.documents.get_mut(collection) {
            for doc in docs.iter_mut().filter(|doc| matches_filter(doc, filter)) {
                *doc = document.clone();
                updated += 1;
            }
        }
        Ok(updated)
    }
}
