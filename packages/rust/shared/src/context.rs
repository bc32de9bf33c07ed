//! Per-process application context.
//!
//! Built exactly once at process start and passed explicitly to every
//! handler, step and ingestion call.

use std::fmt;
use std::sync::Arc;

use crate::config::AppConfig;
use crate::ports::{BlobStore, DocumentStore, QueueService};

/// Opaque credential handed to collaborator backends.
#[derive(Clone)]
pub struct Credential(String);

impl Credential {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    /// Read the credential from the env var named `var_name`, if set and non-empty.
    pub fn from_env(var_name: &str) -> Option<Self> {
        match std::env::var(var_name) {
            Ok(val) if !val.is_empty() => Some(Self(val)),
            _ => None,
        }
    }

    pub fn secret(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(***)")
    }
}

/// Configuration, credential and collaborator handles for one process.
#[derive(Clone)]
pub struct ProcessContext {
    pub configuration: AppConfig,
    pub credential: Option<Credential>,
    pub queues: Arc<dyn QueueService>,
    pub blobs: Arc<dyn BlobStore>,
    pub documents: Arc<dyn DocumentStore>,
}

impl ProcessContext {
    pub fn new(
        configuration: AppConfig,
        credential: Option<Credential>,
        queues: Arc<dyn QueueService>,
        blobs: Arc<dyn BlobStore>,
        documents: Arc<dyn DocumentStore>,
    ) -> Self {
        Self {
            configuration,
            credential,
            queues,
            blobs,
            documents,
        }
    }

    /// The configured step list.
    pub fn steps(&self) -> &[String] {
        &self.configuration.pipeline.steps
    }

    /// Collection holding ContentProcess records.
    pub fn process_collection(&self) -> &str {
        &self.configuration.documents.process_collection
    }

    /// Collection holding registered schemas.
    pub fn schema_collection(&self) -> &str {
        &self.configuration.documents.schema_collection
    }
}

impl fmt::Debug for ProcessContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessContext")
            .field("configuration", &self.configuration)
            .field("credential", &self.credential)
            .finish_non_exhaustive()
    }
}
