//! Queue operations on the libSQL store.
//!
//! A receive leases the oldest visible message in a single UPDATE ..
//! RETURNING statement, so competing workers never lease the same
//! message concurrently. Deleting requires the pop receipt of the
//! current lease.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use docpipe_shared::{DocPipeError, QueueClient, QueueMessage, QueueService, Result};
use libsql::params;
use tracing::debug;
use uuid::Uuid;

use crate::Storage;

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

#[async_trait]
impl QueueService for Storage {
    async fn create_or_get(&self, name: &str) -> Result<Arc<dyn QueueClient>> {
        let now = Utc::now().to_rfc3339();
        self.connection()
            .execute(
                "INSERT INTO queues (name, created_at) VALUES (?1, ?2)
                 ON CONFLICT(name) DO NOTHING",
                params![name, now.as_str()],
            )
            .await
            .map_err(|e| DocPipeError::Queue(format!("create queue {name}: {e}")))?;

        Ok(Arc::new(LocalQueue {
            storage: self.clone(),
            name: name.to_string(),
        }))
    }
}

/// One named queue inside a [`Storage`] database.
pub struct LocalQueue {
    storage: Storage,
    name: String,
}

#[async_trait]
impl QueueClient for LocalQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn receive(&self, visibility_timeout: Duration) -> Result<Option<QueueMessage>> {
        let now = now_millis();
        let visible_at = now + visibility_timeout.as_millis() as i64;
        let receipt = Uuid::now_v7().to_string();

        let mut rows = self
            .storage
            .connection()
            .query(
                "UPDATE queue_messages
                    SET dequeue_count = dequeue_count + 1,
                        pop_receipt = ?1,
                        visible_at = ?2
                  WHERE seq = (
                        SELECT seq FROM queue_messages
                         WHERE queue_name = ?3 AND visible_at <= ?4
                         ORDER BY seq
                         LIMIT 1)
              RETURNING id, body, dequeue_count, inserted_at",
                params![receipt.as_str(), visible_at, self.name.as_str(), now],
            )
            .await
            .map_err(|e| DocPipeError::Queue(format!("receive from {}: {e}", self.name)))?;

        let row = match rows.next().await {
            Ok(Some(row)) => row,
            Ok(None) => return Ok(None),
            Err(e) => return Err(DocPipeError::Queue(e.to_string())),
        };

        let id: String = row.get(0).map_err(|e| DocPipeError::Queue(e.to_string()))?;
        let body: String = row.get(1).map_err(|e| DocPipeError::Queue(e.to_string()))?;
        let dequeue_count: u32 = row.get(2).map_err(|e| DocPipeError::Queue(e.to_string()))?;
        let inserted_at = {
            let s: String = row.get(3).map_err(|e| DocPipeError::Queue(e.to_string()))?;
            DateTime::parse_from_rfc3339(&s)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| DocPipeError::Queue(format!("invalid date: {e}")))?
        };

        debug!(queue = %self.name, message_id = %id, dequeue_count, "message leased");
        Ok(Some(QueueMessage {
            id,
            pop_receipt: receipt,
            body,
            dequeue_count,
            inserted_at,
        }))
    }

    async fn delete(&self, message: &QueueMessage) -> Result<()> {
        let deleted = self
            .storage
            .connection()
            .execute(
                "DELETE FROM queue_messages WHERE id = ?1 AND pop_receipt = ?2",
                params![message.id.as_str(), message.pop_receipt.as_str()],
            )
            .await
            .map_err(|e| DocPipeError::Queue(format!("delete from {}: {e}", self.name)))?;

        if deleted == 0 {
            return Err(DocPipeError::Queue(format!(
                "message {} in {} is no longer leased by this receiver",
                message.id, self.name
            )));
        }
        Ok(())
    }

    async fn enqueue(&self, payload: &str) -> Result<String> {
        let id = Uuid::now_v7().to_string();
        let inserted_at = Utc::now().to_rfc3339();
        self.storage
            .connection()
            .execute(
                "INSERT INTO queue_messages (id, queue_name, body, visible_at, inserted_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    id.as_str(),
                    self.name.as_str(),
                    payload,
                    now_millis(),
                    inserted_at.as_str()
                ],
            )
            .await
            .map_err(|e| DocPipeError::Queue(format!("enqueue to {}: {e}", self.name)))?;
        Ok(id)
    }

    async fn approximate_message_count(&self) -> Result<u64> {
        let mut rows = self
            .storage
            .connection()
            .query(
                "SELECT COUNT(*) FROM queue_messages WHERE queue_name = ?1",
                params![self.name.as_str()],
            )
            .await
            .map_err(|e| DocPipeError::Queue(e.to_string()))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(row.get::<i64>(0).unwrap_or(0).max(0) as u64),
            Ok(None) => Ok(0),
            Err(e) => Err(DocPipeError::Queue(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::test_storage;

    #[tokio::test]
    async fn fifo_receive_and_delete() {
        let storage = test_storage().await;
        let queue = storage.create_or_get("content-pipeline-extract-queue").await.unwrap();

        queue.enqueue("first").await.unwrap();
        queue.enqueue("second").await.unwrap();
        assert_eq!(queue.approximate_message_count().await.unwrap(), 2);

        let msg = queue
            .receive(Duration::from_secs(60))
            .await
            .unwrap()
            .expect("message");
        assert_eq!(msg.body, "first");
        assert_eq!(msg.dequeue_count, 1);

        queue.delete(&msg).await.expect("delete");
        assert_eq!(queue.approximate_message_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn leased_message_is_hidden() {
        let storage = test_storage().await;
        let queue = storage.create_or_get("q").await.unwrap();
        queue.enqueue("only").await.unwrap();

        let first = queue.receive(Duration::from_secs(60)).await.unwrap();
        assert!(first.is_some());
        let second = queue.receive(Duration::from_secs(60)).await.unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn expired_lease_redelivers_and_stale_receipt_cannot_delete() {
        let storage = test_storage().await;
        let queue = storage.create_or_get("q").await.unwrap();
        queue.enqueue("payload").await.unwrap();

        let first = queue.receive(Duration::ZERO).await.unwrap().expect("first lease");
        let second = queue.receive(Duration::ZERO).await.unwrap().expect("redelivery");
        assert_eq!(first.id, second.id);
        assert_eq!(second.dequeue_count, 2);

        assert!(queue.delete(&first).await.is_err());
        queue.delete(&second).await.expect("current lease deletes");
    }

    #[tokio::test]
    async fn queues_are_isolated() {
        let storage = test_storage().await;
        let a = storage.create_or_get("a").await.unwrap();
        let b = storage.create_or_get("b").await.unwrap();
        a.enqueue("x").await.unwrap();

        assert!(b.receive(Duration::from_secs(1)).await.unwrap().is_none());
        assert_eq!(b.approximate_message_count().await.unwrap(), 0);

        // create_or_get is idempotent
        let again = storage.create_or_get("a").await.unwrap();
        assert_eq!(again.approximate_message_count().await.unwrap(), 1);
    }
}
