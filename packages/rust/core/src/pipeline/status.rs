//! Step progression state machine for one work item.
//!
//! A step is in exactly one of three places: `remaining_steps` (not yet
//! finished, in order), `completed_steps` (finished, in order) or, while it
//! runs, `active_step`. `active_step` is also the head of `remaining_steps`
//! until it finishes. After the last step finishes `active_step` keeps
//! pointing at it and `completed` becomes true.

use chrono::{DateTime, Utc};
use docpipe_shared::{BlobStore, DocPipeError, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::step_result::StepResult;

/// Blob holding a standalone status snapshot inside a work item's container.
pub const PIPELINE_STATUS_BLOB_NAME: &str = "pipeline-status.json";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct PipelineStatus {
    pub process_id: Option<String>,
    pub steps: Vec<String>,
    pub active_step: Option<String>,
    pub remaining_steps: Vec<String>,
    pub completed_steps: Vec<String>,
    pub completed: bool,
    pub last_updated_time: Option<DateTime<Utc>>,
    /// Unique by step name; see [`PipelineStatus::add_step_result`].
    pub process_results: Vec<StepResult>,
    /// Bumped on every persisted write; guards against lost updates.
    pub revision: u64,
}

impl PipelineStatus {
    /// Fresh status positioned at the first of `steps`.
    pub fn new(process_id: impl Into<String>, steps: Vec<String>) -> Self {
        Self {
            process_id: Some(process_id.into()),
            active_step: steps.first().cloned(),
            remaining_steps: steps.clone(),
            steps,
            last_updated_time: Some(Utc::now()),
            ..Self::default()
        }
    }

    /// Refresh the timestamp and finish the active step.
    pub fn update_step(&mut self) -> Result<()> {
        self.last_updated_time = Some(Utc::now());

        let finished = self
            .active_step
            .clone()
            .ok_or_else(|| DocPipeError::validation("no active step to advance"))?;
        self.move_to_next_step(&finished)?;

        if let Some(next) = self.remaining_steps.first() {
            self.active_step = Some(next.clone());
        }
        Ok(())
    }

    /// Move `finished_step` from the head of `remaining_steps` to the end of
    /// `completed_steps`. Anything other than the head is rejected.
    pub fn move_to_next_step(&mut self, finished_step: &str) -> Result<()> {
        match self.remaining_steps.first() {
            Some(head) if head == finished_step => {}
            Some(head) => {
                return Err(DocPipeError::validation(format!(
                    "cannot finish '{finished_step}': next remaining step is '{head}'"
                )));
            }
            None => {
                return Err(DocPipeError::validation(format!(
                    "cannot finish '{finished_step}': no steps remain"
                )));
            }
        }

        let step = self.remaining_steps.remove(0);
        debug!(step = %step, remaining = self.remaining_steps.len(), "step finished");
        self.completed_steps.push(step);
        self.completed = self.remaining_steps.is_empty();
        Ok(())
    }

    pub fn get_step_result(&self, step_name: &str) -> Option<&StepResult> {
        self.process_results
            .iter()
            .find(|r| r.step_name.as_deref() == Some(step_name))
    }

    /// Result of the finished step closest before `current_step`.
    ///
    /// Returns `None` while nothing has finished. When `current_step` is not
    /// part of `steps`, the most recently finished step is used.
    pub fn get_previous_step_result(&self, current_step: &str) -> Option<&StepResult> {
        if self.completed_steps.is_empty() {
            return None;
        }

        let previous = match self.steps.iter().position(|s| s == current_step) {
            Some(current) => self.completed_steps.iter().rev().find(|done| {
                self.steps
                    .iter()
                    .position(|s| s == *done)
                    .is_some_and(|i| i < current)
            }),
            None => self.completed_steps.last(),
        }?;

        self.get_step_result(previous)
    }

    /// Insert `result`, replacing any earlier result for the same step in place.
    pub fn add_step_result(&mut self, result: StepResult) {
        match self
            .process_results
            .iter_mut()
            .find(|r| r.step_name.is_some() && r.step_name == result.step_name)
        {
            Some(existing) => *existing = result,
            None => self.process_results.push(result),
        }
    }

    /// Write this status on its own to the work item's container.
    pub async fn save_to_persistent_storage(&self, blobs: &dyn BlobStore) -> Result<u64> {
        let process_id = match self.process_id.as_deref() {
            Some(id) if !id.is_empty() => id,
            _ => {
                return Err(DocPipeError::validation(
                    "Process ID is required to save the result.",
                ));
            }
        };
        let json = serde_json::to_string(self)
            .map_err(|e| DocPipeError::Storage(format!("failed to serialize status: {e}")))?;
        blobs
            .upload_text(process_id, PIPELINE_STATUS_BLOB_NAME, &json)
            .await
    }
}
