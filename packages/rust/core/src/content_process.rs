//! Per-work-item status record kept in the document store.
//!
//! This is what operators and the `status` command look at: which step a
//! document is in, when it last changed, and the output each step reported.

use chrono::{DateTime, Utc};
use docpipe_shared::{DocPipeError, DocumentStore, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

pub const STATUS_QUEUED: &str = "Queued";
pub const STATUS_COMPLETED: &str = "Completed";
pub const STATUS_ERROR: &str = "Error";
pub const STATUS_FAILED: &str = "Failed";

/// Output reported by one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepOutput {
    pub step_name: String,
    pub processed_time: String,
    #[serde(default)]
    pub step_result: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContentProcess {
    pub process_id: String,
    pub processed_file_name: Option<String>,
    pub processed_file_mime_type: Option<String>,
    pub schema_id: Option<String>,
    pub status: Option<String>,
    pub imported_time: Option<DateTime<Utc>>,
    pub last_modified_time: Option<DateTime<Utc>>,
    pub last_modified_by: Option<String>,
    pub error: Option<String>,
    pub process_output: Vec<StepOutput>,
}

fn id_filter(process_id: &str) -> Map<String, Value> {
    let mut filter = Map::new();
    filter.insert("process_id".into(), Value::String(process_id.to_string()));
    filter
}

impl ContentProcess {
    pub fn new(process_id: impl Into<String>, status: impl Into<String>) -> Self {
        Self {
            process_id: process_id.into(),
            status: Some(status.into()),
            ..Self::default()
        }
    }

    /// Load the record for `process_id`, if one exists.
    pub async fn load(
        documents: &dyn DocumentStore,
        collection: &str,
        process_id: &str,
    ) -> Result<Option<Self>> {
        let found = documents.find(collection, &id_filter(process_id)).await?;
        found
            .into_iter()
            .next()
            .map(|doc| {
                serde_json::from_value(doc).map_err(|e| {
                    DocPipeError::parse(format!("Failed to parse process record {process_id}: {e}"))
                })
            })
            .transpose()
    }

    /// Replace the stored record with this one, inserting it when absent.
    pub async fn update_process_status(
        &self,
        documents: &dyn DocumentStore,
        collection: &str,
    ) -> Result<()> {
        let filter = id_filter(&self.process_id);
        let document = serde_json::to_value(self)
            .map_err(|e| DocPipeError::Storage(format!("failed to serialize process record: {e}")))?;

        if documents.find(collection, &filter).await?.is_empty() {
            documents.insert(collection, &document).await?;
            debug!(process_id = %self.process_id, "process record inserted");
        } else {
            documents.update(collection, &filter, &document).await?;
            debug!(process_id = %self.process_id, "process record updated");
        }
        Ok(())
    }

    /// Patch only the status fields of the stored record, keeping its step
    /// outputs. Inserts this record when none exists.
    pub async fn update_status(
        &self,
        documents: &dyn DocumentStore,
        collection: &str,
    ) -> Result<()> {
        let merged = match Self::load(documents, collection, &self.process_id).await? {
            Some(mut stored) => {
                stored.status = self.status.clone();
                stored.last_modified_time = self.last_modified_time;
                stored.last_modified_by = self.last_modified_by.clone();
                stored.error = self.error.clone();
                stored
            }
            None => self.clone(),
        };
        merged.update_process_status(documents, collection).await
    }

    /// Record `status` for `process_id`, as changed by `modified_by`.
    pub async fn set_status(
        documents: &dyn DocumentStore,
        collection: &str,
        process_id: &str,
        status: &str,
        modified_by: &str,
        error: Option<String>,
    ) -> Result<()> {
        let record = Self {
            last_modified_time: Some(Utc::now()),
            last_modified_by: Some(modified_by.to_string()),
            error,
            ..Self::new(process_id, status)
        };
        record.update_status(documents, collection).await
    }

    /// Add or replace the output recorded for `step_name`.
    pub fn add_step_output(&mut self, step_name: &str, step_result: Value) {
        let output = StepOutput {
            step_name: step_name.to_string(),
            processed_time: Utc::now().to_rfc3339(),
            step_result,
        };
        match self
            .process_output
            .iter_mut()
            .find(|o| o.step_name == step_name)
        {
            Some(existing) => *existing = output,
            None => self.process_output.push(output),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docpipe_storage::memory::MemoryBackend;
    use serde_json::json;

    const COLLECTION: &str = "Processes";

    #[tokio::test]
    async fn upsert_inserts_then_updates() {
        let backend = MemoryBackend::new();
        let record = ContentProcess::new("test-123", "processing");
        record.update_process_status(&backend, COLLECTION).await.unwrap();

        let record = ContentProcess::new("test-123", "completed");
        record.update_process_status(&backend, COLLECTION).await.unwrap();

        let all = backend.find(COLLECTION, &Map::new()).await.unwrap();
        assert_eq!(all.len(), 1);
        let loaded = ContentProcess::load(&backend, COLLECTION, "test-123")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.status.as_deref(), Some("completed"));
    }

    #[tokio::test]
    async fn status_update_keeps_step_outputs() {
        let backend = MemoryBackend::new();
        let mut record = ContentProcess::new("p-1", STATUS_QUEUED);
        record.processed_file_name = Some("doc.pdf".into());
        record.add_step_output("extract", json!({"extracted": "data"}));
        record.update_process_status(&backend, COLLECTION).await.unwrap();

        ContentProcess::set_status(&backend, COLLECTION, "p-1", STATUS_ERROR, "map", Some("boom".into()))
            .await
            .unwrap();

        let loaded = ContentProcess::load(&backend, COLLECTION, "p-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.status.as_deref(), Some(STATUS_ERROR));
        assert_eq!(loaded.error.as_deref(), Some("boom"));
        assert_eq!(loaded.last_modified_by.as_deref(), Some("map"));
        assert_eq!(loaded.processed_file_name.as_deref(), Some("doc.pdf"));
        assert_eq!(loaded.process_output.len(), 1);
    }

    #[test]
    fn step_output_replaces_same_step() {
        let mut record = ContentProcess::new("p-1", STATUS_QUEUED);
        record.add_step_output("save", json!(1));
        record.add_step_output("save", json!(2));
        assert_eq!(record.process_output.len(), 1);
        assert_eq!(record.process_output[0].step_result, json!(2));
    }

    #[tokio::test]
    async fn load_missing_record_is_none() {
        let backend = MemoryBackend::new();
        assert!(
            ContentProcess::load(&backend, COLLECTION, "nope")
                .await
                .unwrap()
                .is_none()
        );
    }
}
