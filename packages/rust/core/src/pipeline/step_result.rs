//! Durable outcome of one step for one work item.

use std::time::Duration;

use docpipe_shared::{BlobStore, DocPipeError, Result, step_result_blob_name};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// Status stamped on a result whose step did not set one.
pub const STATUS_COMPLETED: &str = "completed";

/// Result of executing one step. Every field is optional on the wire so
/// partially filled results from older writers still deserialize.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StepResult {
    pub process_id: Option<String>,
    pub step_name: Option<String>,
    pub result: Option<Value>,
    /// Wall-clock duration, `HH:MM:SS.mmm`.
    pub elapsed: Option<String>,
    pub status: Option<String>,
}

impl StepResult {
    pub fn new(
        process_id: impl Into<String>,
        step_name: impl Into<String>,
        result: Value,
    ) -> Self {
        Self {
            process_id: Some(process_id.into()),
            step_name: Some(step_name.into()),
            result: Some(result),
            elapsed: None,
            status: None,
        }
    }

    pub fn with_elapsed(mut self, elapsed: Duration) -> Self {
        self.elapsed = Some(format_elapsed(elapsed));
        self
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    /// Write this result to `<step_name>-result.json` in the work item's container.
    pub async fn save_to_persistent_storage(&self, blobs: &dyn BlobStore) -> Result<u64> {
        let process_id = match self.process_id.as_deref() {
            Some(id) if !id.is_empty() => id,
            _ => {
                return Err(DocPipeError::validation(
                    "Process ID is required to save the result.",
                ));
            }
        };
        let step_name = match self.step_name.as_deref() {
            Some(name) if !name.is_empty() => name,
            _ => {
                return Err(DocPipeError::validation(
                    "Step name is required to save the result.",
                ));
            }
        };

        let json = serde_json::to_string(self)
            .map_err(|e| DocPipeError::Storage(format!("failed to serialize step result: {e}")))?;
        let blob_name = step_result_blob_name(step_name);
        let size = blobs.upload_text(process_id, &blob_name, &json).await?;
        debug!(process_id, step = step_name, size, "step result saved");
        Ok(size)
    }
}

/// Format a duration as `HH:MM:SS.mmm`.
pub fn format_elapsed(elapsed: Duration) -> String {
    let millis = elapsed.as_millis();
    let hours = millis / 3_600_000;
    let minutes = (millis / 60_000) % 60;
    let seconds = (millis / 1_000) % 60;
    let ms = millis % 1_000;
    format!("{hours:02}:{minutes:02}:{seconds:02}.{ms:03}")
}
