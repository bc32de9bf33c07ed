//! Shared domain types and naming conventions.
//!
//! Queue and blob names are part of the wire contract between handlers
//! and must stay byte-for-byte stable.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DocPipeError;

/// Blob holding the serialized pipeline inside a work item's container.
pub const PIPELINE_BLOB_NAME: &str = "process-status.json";

// ---------------------------------------------------------------------------
// ArtifactType
// ---------------------------------------------------------------------------

/// Semantic role of a file, independent of the step that produced it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactType {
    #[default]
    Undefined,
    SourceContent,
    ConvertedContent,
    ExtractedContent,
    SchemaMappedData,
    ScoreMergedData,
    SavedContent,
}

impl ArtifactType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Undefined => "undefined",
            Self::SourceContent => "source_content",
            Self::ConvertedContent => "converted_content",
            Self::ExtractedContent => "extracted_content",
            Self::SchemaMappedData => "schema_mapped_data",
            Self::ScoreMergedData => "score_merged_data",
            Self::SavedContent => "saved_content",
        }
    }
}

impl std::fmt::Display for ArtifactType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ArtifactType {
    type Err = DocPipeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "undefined" => Ok(Self::Undefined),
            "source_content" => Ok(Self::SourceContent),
            "converted_content" => Ok(Self::ConvertedContent),
            "extracted_content" => Ok(Self::ExtractedContent),
            "schema_mapped_data" => Ok(Self::SchemaMappedData),
            "score_merged_data" => Ok(Self::ScoreMergedData),
            "saved_content" => Ok(Self::SavedContent),
            other => Err(DocPipeError::parse(format!("unknown artifact type '{other}'"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Identifiers and names
// ---------------------------------------------------------------------------

/// Generate a new time-sortable work-item id.
pub fn new_process_id() -> String {
    Uuid::now_v7().to_string()
}

/// Request queue consumed by the handler of `step_name`.
pub fn request_queue_name(step_name: &str) -> String {
    format!("content-pipeline-{step_name}-queue")
}

/// Dead-letter queue paired with the request queue of `step_name`.
pub fn dead_letter_queue_name(step_name: &str) -> String {
    format!("{}-dead-letter-queue", request_queue_name(step_name))
}

/// Blob holding the result of `step_name` inside a work item's container.
pub fn step_result_blob_name(step_name: &str) -> String {
    format!("{step_name}-result.json")
}
