//! Artifacts produced or consumed while processing a work item.

use std::path::Path;

use chrono::{DateTime, Utc};
use docpipe_shared::{ArtifactType, BlobStore, DocPipeError, Result};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const JSON_MIME_TYPE: &str = "application/json";

/// One line of a file's processing log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub source: String,
    pub message: String,
    pub datetime_offset: DateTime<Utc>,
}

/// A file belonging to one work item, stored as blob `<name>` in the
/// container named after the work item.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileEntry {
    pub id: String,
    pub process_id: String,
    pub name: String,
    pub size: u64,
    pub mime_type: Option<String>,
    pub artifact_type: ArtifactType,
    /// Step that was active when the entry was created.
    pub processed_by: Option<String>,
    pub log_entries: Vec<LogEntry>,
}

impl FileEntry {
    pub fn new(
        process_id: impl Into<String>,
        name: impl Into<String>,
        artifact_type: ArtifactType,
        processed_by: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            process_id: process_id.into(),
            name: name.into(),
            artifact_type,
            processed_by,
            ..Self::default()
        }
    }

    /// Append a log line. Returns `self` for chaining.
    pub fn add_log_entry(
        &mut self,
        source: impl Into<String>,
        message: impl Into<String>,
    ) -> &mut Self {
        self.log_entries.push(LogEntry {
            source: source.into(),
            message: message.into(),
            datetime_offset: Utc::now(),
        });
        self
    }

    fn container(&self) -> Result<&str> {
        if self.process_id.is_empty() {
            return Err(DocPipeError::validation(format!(
                "Process ID is required to store file '{}'",
                self.name
            )));
        }
        Ok(&self.process_id)
    }

    /// Upload raw bytes and record their size.
    pub async fn upload_stream(&mut self, blobs: &dyn BlobStore, data: &[u8]) -> Result<u64> {
        let size = blobs.upload(self.container()?, &self.name, data).await?;
        self.size = size;
        Ok(size)
    }

    /// Upload JSON text, recording its size and the JSON mime type.
    pub async fn upload_json_text(&mut self, blobs: &dyn BlobStore, text: &str) -> Result<u64> {
        let size = blobs.upload_text(self.container()?, &self.name, text).await?;
        self.size = size;
        self.mime_type = Some(JSON_MIME_TYPE.to_string());
        Ok(size)
    }

    pub async fn download_stream(&self, blobs: &dyn BlobStore) -> Result<Vec<u8>> {
        blobs.download(self.container()?, &self.name).await
    }

    /// Download the blob into a local file at `path`.
    pub async fn download_file(&self, blobs: &dyn BlobStore, path: &Path) -> Result<()> {
        let data = self.download_stream(blobs).await?;
        tokio::fs::write(path, data)
            .await
            .map_err(|e| DocPipeError::io(path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docpipe_storage::memory::MemoryBackend;

    #[test]
    fn log_entries_chain() {
        let mut file = FileEntry::new("proc-123", "a.pdf", ArtifactType::SourceContent, None);
        file.add_log_entry("step1", "Step 1 done")
            .add_log_entry("step2", "Step 2 done");
        assert_eq!(file.log_entries.len(), 2);
        assert_eq!(file.log_entries[0].source, "step1");
        assert_eq!(file.log_entries[1].message, "Step 2 done");
    }

    #[tokio::test]
    async fn upload_stream_sets_size_only() {
        let backend = MemoryBackend::new();
        let mut file = FileEntry::new("proc-123", "output.bin", ArtifactType::Undefined, None);
        let data = b"binary content data";

        file.upload_stream(&backend, data).await.unwrap();
        assert_eq!(file.size, data.len() as u64);
        assert!(file.mime_type.is_none());
        assert_eq!(file.download_stream(&backend).await.unwrap(), data);
    }

    #[tokio::test]
    async fn upload_json_text_sets_size_and_mime() {
        let backend = MemoryBackend::new();
        let mut file = FileEntry::new("proc-123", "data.json", ArtifactType::Undefined, None);
        let text = r#"{"key": "value"}"#;

        file.upload_json_text(&backend, text).await.unwrap();
        assert_eq!(file.size, text.len() as u64);
        assert_eq!(file.mime_type.as_deref(), Some("application/json"));
        assert_eq!(backend.download("proc-123", "data.json").await.unwrap(), text.as_bytes());
    }

    #[tokio::test]
    async fn download_file_writes_local_copy() {
        let backend = MemoryBackend::new();
        let mut file = FileEntry::new("proc-123", "test.pdf", ArtifactType::SourceContent, None);
        file.upload_stream(&backend, b"file content").await.unwrap();

        let path = std::env::temp_dir().join(format!("docpipe_dl_{}.pdf", Uuid::now_v7()));
        file.download_file(&backend, &path).await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"file content");
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn upload_without_process_id_fails() {
        let backend = MemoryBackend::new();
        let mut file = FileEntry {
            name: "x.json".into(),
            ..FileEntry::default()
        };
        let err = file.upload_json_text(&backend, "{}").await.unwrap_err();
        assert!(matches!(err, DocPipeError::Validation { .. }));
    }
}
