//! The work-item aggregate passed between handlers.

use docpipe_shared::{ArtifactType, BlobStore, DocPipeError, PIPELINE_BLOB_NAME, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::file::FileEntry;
use super::status::PipelineStatus;
use super::step_result::StepResult;

/// Status plus artifact registry for one work item.
///
/// Serialized as `{"process_id": .., "PipelineStatus": {..}, "Files": [..]}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Pipeline {
    #[serde(default)]
    pub process_id: Option<String>,
    /// Schema the mapping step projects onto; absent means keep every field.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_id: Option<String>,
    #[serde(rename = "PipelineStatus", default)]
    pub pipeline_status: PipelineStatus,
    #[serde(rename = "Files", default)]
    pub files: Vec<FileEntry>,
}

impl Pipeline {
    /// New work item positioned at the first of `steps`.
    pub fn new(process_id: impl Into<String>, steps: Vec<String>) -> Self {
        let process_id = process_id.into();
        Self {
            pipeline_status: PipelineStatus::new(process_id.clone(), steps),
            process_id: Some(process_id),
            schema_id: None,
            files: Vec::new(),
        }
    }

    /// Parse a pipeline from JSON.
    ///
    /// The status and file entries inherit the pipeline's id when they carry
    /// none; ids that disagree are rejected.
    pub fn get_object(json: &str) -> Result<Self> {
        let mut pipeline: Self = serde_json::from_str(json)
            .map_err(|e| DocPipeError::parse(format!("Failed to parse pipeline JSON: {e}")))?;

        let Some(id) = pipeline.process_id.clone() else {
            return Ok(pipeline);
        };

        match pipeline.pipeline_status.process_id.as_deref() {
            None => pipeline.pipeline_status.process_id = Some(id.clone()),
            Some(status_id) if status_id != id => {
                return Err(DocPipeError::parse(format!(
                    "Failed to parse pipeline JSON: process id '{id}' does not match status id '{status_id}'"
                )));
            }
            Some(_) => {}
        }

        for file in &mut pipeline.files {
            if file.process_id.is_empty() {
                file.process_id = id.clone();
            } else if file.process_id != id {
                return Err(DocPipeError::parse(format!(
                    "Failed to parse pipeline JSON: file '{}' belongs to '{}', not '{id}'",
                    file.name, file.process_id
                )));
            }
        }
        Ok(pipeline)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| DocPipeError::Storage(format!("failed to serialize pipeline: {e}")))
    }

    /// The work-item id, or a validation error when unset.
    pub fn require_process_id(&self) -> Result<&str> {
        match self.process_id.as_deref() {
            Some(id) if !id.is_empty() => Ok(id),
            _ => Err(DocPipeError::validation(
                "Process ID is required to save the result.",
            )),
        }
    }

    // -----------------------------------------------------------------------
    // Artifact registry
    // -----------------------------------------------------------------------

    /// Register a new file produced by the currently active step.
    pub fn add_file(&mut self, name: impl Into<String>, artifact_type: ArtifactType) -> &mut FileEntry {
        let entry = FileEntry::new(
            self.process_id.clone().unwrap_or_default(),
            name,
            artifact_type,
            self.pipeline_status.active_step.clone(),
        );
        self.files.push(entry);
        let last = self.files.len() - 1;
        &mut self.files[last]
    }

    /// Return the entry named `name`, registering it first when absent.
    ///
    /// Re-running a step writes the same blob names, so reusing the entry
    /// keeps the registry free of duplicates.
    pub fn upsert_file(&mut self, name: &str, artifact_type: ArtifactType) -> &mut FileEntry {
        let active = self.pipeline_status.active_step.clone();
        match self
            .files
            .iter()
            .position(|f| f.name == name && f.artifact_type == artifact_type)
        {
            Some(index) => {
                let entry = &mut self.files[index];
                entry.processed_by = active;
                entry
            }
            None => self.add_file(name, artifact_type),
        }
    }

    /// Files with artifact type `SourceContent`, in insertion order.
    pub fn get_source_files(&self) -> Vec<&FileEntry> {
        self.files
            .iter()
            .filter(|f| f.artifact_type == ArtifactType::SourceContent)
            .collect()
    }

    /// Files produced by `processed_by` with the given artifact type.
    pub fn find_files(&self, processed_by: &str, artifact_type: ArtifactType) -> Vec<&FileEntry> {
        self.files
            .iter()
            .filter(|f| {
                f.processed_by.as_deref() == Some(processed_by) && f.artifact_type == artifact_type
            })
            .collect()
    }

    /// Exactly one file produced by `processed_by` with `artifact_type`.
    pub fn find_single_file(
        &self,
        processed_by: &str,
        artifact_type: ArtifactType,
    ) -> Result<&FileEntry> {
        let matches = self.find_files(processed_by, artifact_type);
        match matches.as_slice() {
            [only] => Ok(*only),
            [] => Err(DocPipeError::not_found(format!(
                "no {artifact_type} file processed by '{processed_by}'"
            ))),
            many => Err(DocPipeError::ambiguous(format!(
                "{} {artifact_type} files processed by '{processed_by}'",
                many.len()
            ))),
        }
    }

    pub fn get_step_result(&self, step_name: &str) -> Option<&StepResult> {
        self.pipeline_status.get_step_result(step_name)
    }

    pub fn get_previous_step_result(&self, current_step: &str) -> Option<&StepResult> {
        self.pipeline_status.get_previous_step_result(current_step)
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    /// Database persistence has no built-in backend.
    pub fn save_to_database(&self) -> Result<()> {
        Err(DocPipeError::NotImplemented(
            "Pipeline::save_to_database".into(),
        ))
    }

    /// Write the whole pipeline to `process-status.json` in its container.
    ///
    /// Refuses with `Conflict` when the stored copy has a newer revision than
    /// this one; otherwise bumps the revision and overwrites.
    pub async fn save_to_persistent_storage(&mut self, blobs: &dyn BlobStore) -> Result<u64> {
        let process_id = self.require_process_id()?.to_string();

        if let Some(stored) = Self::load_from_persistent_storage(blobs, &process_id).await? {
            let stored_revision = stored.pipeline_status.revision;
            if stored_revision > self.pipeline_status.revision {
                return Err(DocPipeError::conflict(format!(
                    "pipeline {process_id} was saved at revision {stored_revision}, this copy is at {}",
                    self.pipeline_status.revision
                )));
            }
        }

        self.pipeline_status.revision += 1;
        let json = self.to_json()?;
        let size = blobs
            .upload_text(&process_id, PIPELINE_BLOB_NAME, &json)
            .await?;
        debug!(process_id = %process_id, revision = self.pipeline_status.revision, "pipeline saved");
        Ok(size)
    }

    /// Read the stored pipeline for `process_id`; `None` when nothing is stored yet.
    pub async fn load_from_persistent_storage(
        blobs: &dyn BlobStore,
        process_id: &str,
    ) -> Result<Option<Self>> {
        match blobs.download(process_id, PIPELINE_BLOB_NAME).await {
            Ok(bytes) => {
                let text = String::from_utf8(bytes).map_err(|e| {
                    DocPipeError::parse(format!("Failed to parse stored pipeline {process_id}: {e}"))
                })?;
                Self::get_object(&text).map(Some)
            }
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }
}
