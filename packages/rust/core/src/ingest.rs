//! Entry point that turns an uploaded document into a queued work item.

use docpipe_shared::{
    ArtifactType, DocPipeError, ProcessContext, Result, new_process_id, request_queue_name,
};
use tracing::{info, instrument};

use crate::content_process::{self, ContentProcess};
use crate::pipeline::{Pipeline, Schema};

/// Where a submitted document went.
#[derive(Debug, Clone)]
pub struct Submission {
    pub process_id: String,
    pub queue_name: String,
    pub message_id: String,
    pub pipeline: Pipeline,
}

/// Store `bytes` as the source file of a new work item and queue it for
/// the first configured step.
///
/// A `schema_id` must name a registered schema; it is checked before
/// anything is stored.
#[instrument(skip_all, fields(file_name = %file_name, size = bytes.len(), schema_id = ?schema_id))]
pub async fn submit_document(
    ctx: &ProcessContext,
    file_name: &str,
    bytes: &[u8],
    schema_id: Option<&str>,
) -> Result<Submission> {
    let steps = ctx.steps().to_vec();
    let Some(first_step) = steps.first().cloned() else {
        return Err(DocPipeError::validation("pipeline has no steps configured"));
    };
    if file_name.trim().is_empty() {
        return Err(DocPipeError::validation("file name is required"));
    }
    if bytes.is_empty() {
        return Err(DocPipeError::validation(format!("'{file_name}' is empty")));
    }

    let schema_id = match schema_id {
        Some(id) => Some(
            Schema::get_schema(ctx.documents.as_ref(), ctx.schema_collection(), Some(id))
                .await?
                .id,
        ),
        None => None,
    };

    let process_id = new_process_id();
    let mime_type = mime_guess::from_path(file_name)
        .first_or_octet_stream()
        .essence_str()
        .to_string();

    let mut pipeline = Pipeline::new(process_id.clone(), steps);
    pipeline.schema_id = schema_id.clone();
    let source = pipeline.add_file(file_name, ArtifactType::SourceContent);
    source.mime_type = Some(mime_type.clone());
    source.upload_stream(ctx.blobs.as_ref(), bytes).await?;
    source.add_log_entry("ingest", "source uploaded");

    pipeline
        .save_to_persistent_storage(ctx.blobs.as_ref())
        .await?;

    let mut record = ContentProcess::new(process_id.clone(), content_process::STATUS_QUEUED);
    record.processed_file_name = Some(file_name.to_string());
    record.processed_file_mime_type = Some(mime_type);
    record.schema_id = schema_id;
    record.imported_time = Some(chrono::Utc::now());
    record.last_modified_time = record.imported_time;
    record.last_modified_by = Some("ingest".into());
    record
        .update_process_status(ctx.documents.as_ref(), ctx.process_collection())
        .await?;

    let queue = ctx
        .queues
        .create_or_get(&request_queue_name(&first_step))
        .await?;
    let message_id = queue.enqueue(&pipeline.to_json()?).await?;

    info!(process_id = %process_id, queue = %queue.name(), "document submitted");
    Ok(Submission {
        process_id,
        queue_name: queue.name().to_string(),
        message_id,
        pipeline,
    })
}
