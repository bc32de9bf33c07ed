//! libSQL-backed collaborator storage for docpipe.
//!
//! The [`Storage`] struct wraps a libSQL database (local file or remote)
//! and implements the three collaborator interfaces the pipeline core
//! consumes: queues ([`QueueService`]), blobs ([`BlobStore`]) and JSON
//! documents ([`DocumentStore`]). Several worker processes may share one
//! local database file; writes are serialized by SQLite's locking.
//!
//! [`memory::MemoryBackend`] offers the same contracts without a database.

pub mod memory;
mod migrations;
mod queue;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use docpipe_shared::{
    AppConfig, BlobStore, Credential, DocPipeError, DocumentStore, ProcessContext, QueueService,
    Result, matches_filter,
};
use libsql::{Connection, Database, params};
use serde_json::{Map, Value};
use tracing::{debug, info};
use uuid::Uuid;

pub use queue::LocalQueue;

/// Milliseconds SQLite waits on a locked database before giving up.
const BUSY_TIMEOUT_MS: u32 = 5_000;

/// Primary storage handle wrapping a libSQL database. Cheap to clone.
#[derive(Clone)]
pub struct Storage {
    #[allow(dead_code)]
    db: Arc<Database>,
    conn: Connection,
}

impl Storage {
    /// Open or create a local database at `path`.
    pub async fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| DocPipeError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DocPipeError::Storage(e.to_string()))?;

        let storage = Self::from_database(db)?;
        storage.configure_local().await?;
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Connect to a remote libSQL database.
    pub async fn open_remote(url: &str, credential: &Credential) -> Result<Self> {
        let db = libsql::Builder::new_remote(url.to_string(), credential.secret().to_string())
            .build()
            .await
            .map_err(|e| DocPipeError::Storage(e.to_string()))?;

        let storage = Self::from_database(db)?;
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open whichever database the `[storage]` section describes.
    pub async fn open_configured(
        config: &AppConfig,
        credential: Option<&Credential>,
    ) -> Result<Self> {
        match (&config.storage.database_url, credential) {
            (Some(url), Some(credential)) => {
                info!(url = %url, "opening remote database");
                Self::open_remote(url, credential).await
            }
            (Some(_), None) => Err(DocPipeError::config(format!(
                "database_url is set but {} holds no auth token",
                config.storage.auth_token_env
            ))),
            (None, _) => {
                let path = config.storage.resolved_database_path()?;
                info!(path = %path.display(), "opening local database");
                Self::open(&path).await
            }
        }
    }

    fn from_database(db: Database) -> Result<Self> {
        let conn = db
            .connect()
            .map_err(|e| DocPipeError::Storage(e.to_string()))?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    /// WAL + busy timeout so several worker processes can share the file.
    async fn configure_local(&self) -> Result<()> {
        for pragma in [
            "PRAGMA journal_mode = WAL".to_string(),
            format!("PRAGMA busy_timeout = {BUSY_TIMEOUT_MS}"),
        ] {
            self.conn
                .query(&pragma, params![])
                .await
                .map_err(|e| DocPipeError::Storage(format!("{pragma} failed: {e}")))?;
        }
        Ok(())
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn.execute_batch(migration.sql).await.map_err(|e| {
                    DocPipeError::Storage(format!(
                        "migration v{} failed: {e}",
                        migration.version
                    ))
                })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    pub async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    pub(crate) fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn queues(&self) -> Arc<dyn QueueService> {
        Arc::new(self.clone())
    }

    pub fn blobs(&self) -> Arc<dyn BlobStore> {
        Arc::new(self.clone())
    }

    pub fn documents(&self) -> Arc<dyn DocumentStore> {
        Arc::new(self.clone())
    }

    /// Assemble a [`ProcessContext`] whose collaborators all live in this database.
    pub fn process_context(
        &self,
        configuration: AppConfig,
        credential: Option<Credential>,
    ) -> ProcessContext {
        ProcessContext::new(
            configuration,
            credential,
            self.queues(),
            self.blobs(),
            self.documents(),
        )
    }

    // -----------------------------------------------------------------------
    // Document helpers
    // -----------------------------------------------------------------------

    /// Load `(id, body)` pairs of a collection in insertion order.
    async fn load_collection(&self, collection: &str) -> Result<Vec<(String, Value)>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, body FROM documents WHERE collection = ?1 ORDER BY rowid",
                params![collection],
            )
            .await
            .map_err(|e| DocPipeError::Storage(e.to_string()))?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let id: String = row
                .get(0)
                .map_err(|e| DocPipeError::Storage(e.to_string()))?;
            let body: String = row
                .get(1)
                .map_err(|e| DocPipeError::Storage(e.to_string()))?;
            let value: Value = serde_json::from_str(&body).map_err(|e| {
                DocPipeError::Storage(format!("corrupt document {collection}/{id}: {e}"))
            })?;
            results.push((id, value));
        }
        Ok(results)
    }
}

// ---------------------------------------------------------------------------
// Blob operations
// ---------------------------------------------------------------------------

#[async_trait]
impl BlobStore for Storage {
    async fn upload(&self, container: &str, blob_name: &str, data: &[u8]) -> Result<u64> {
        let size = data.len() as u64;
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO blobs (container, name, data, size, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(container, name) DO UPDATE SET
                   data = excluded.data,
                   size = excluded.size,
                   updated_at = excluded.updated_at",
                params![
                    container,
                    blob_name,
                    libsql::Value::Blob(data.to_vec()),
                    size as i64,
                    now.as_str()
                ],
            )
            .await
            .map_err(|e| DocPipeError::Storage(e.to_string()))?;
        debug!(container, blob_name, size, "blob uploaded");
        Ok(size)
    }

    async fn download(&self, container: &str, blob_name: &str) -> Result<Vec<u8>> {
        let mut rows = self
            .conn
            .query(
                "SELECT data FROM blobs WHERE container = ?1 AND name = ?2",
                params![container, blob_name],
            )
            .await
            .map_err(|e| DocPipeError::Storage(e.to_string()))?;

        match rows.next().await {
            Ok(Some(row)) => row
                .get::<Vec<u8>>(0)
                .map_err(|e| DocPipeError::Storage(e.to_string())),
            Ok(None) => Err(DocPipeError::not_found(format!(
                "blob {container}/{blob_name}"
            ))),
            Err(e) => Err(DocPipeError::Storage(e.to_string())),
        }
    }

    async fn exists(&self, container: &str, blob_name: &str) -> Result<bool> {
        let mut rows = self
            .conn
            .query(
                "SELECT 1 FROM blobs WHERE container = ?1 AND name = ?2",
                params![container, blob_name],
            )
            .await
            .map_err(|e| DocPipeError::Storage(e.to_string()))?;

        match rows.next().await {
            Ok(row) => Ok(row.is_some()),
            Err(e) => Err(DocPipeError::Storage(e.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// Document operations
// ---------------------------------------------------------------------------

#[async_trait]
impl DocumentStore for Storage {
    async fn find(&self, collection: &str, filter: &Map<String, Value>) -> Result<Vec<Value>> {
        Ok(self
            .load_collection(collection)
            .await?
            .into_iter()
            .map(|(_, body)| body)
            .filter(|body| matches_filter(body, filter))
            .collect())
    }

    async fn insert(&self, collection: &str, document: &Value) -> Result<()> {
        let id = document
            .get("id")
            .and_then(Value::as_str)
            .map(String::from)
            .unwrap_or_else(|| Uuid::now_v7().to_string());
        let body = serde_json::to_string(document)
            .map_err(|e| DocPipeError::Storage(format!("failed to serialize document: {e}")))?;
        let now = Utc::now().to_rfc3339();

        self.conn
            .execute(
                "INSERT INTO documents (collection, id, body, updated_at) VALUES (?1, ?2, ?3, ?4)",
                params![collection, id.as_str(), body.as_str(), now.as_str()],
            )
            .await
            .map_err(|e| DocPipeError::Storage(e.to_string()))?;
        Ok(())
    }

    async fn update(
        &self,
        collection: &str,
        filter: &Map<String, Value>,
        document: &Value,
    ) -> Result<u64> {
        let body = serde_json::to_string(document)
            .map_err(|e| DocPipeError::Storage(format!("failed to serialize document: {e}")))?;
        let now = Utc::now().to_rfc3339();

        let mut updated = 0;
        for (id, existing) in self.load_collection(collection).await? {
            if !matches_filter(&existing, filter) {
                continue;
            }
            updated += self
                .conn
                .execute(
                    "UPDATE documents SET body = ?1, updated_at = ?2 WHERE collection = ?3 AND id = ?4",
                    params![body.as_str(), now.as_str(), collection, id.as_str()],
                )
                .await
                .map_err(|e| DocPipeError::Storage(e.to_string()))?;
        }
        Ok(updated)
    }
}
