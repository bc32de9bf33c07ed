//! Per-step queue worker.
//!
//! A [`Handler`] owns the request queue and dead-letter queue of one step.
//! Each cycle leases one message, rehydrates the pipeline it carries, runs
//! the step, persists the result and advanced status, forwards the pipeline
//! to the next step's queue and only then deletes the message. Anything that
//! fails before the delete leaves the message to reappear after its lease.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use docpipe_shared::{
    ArtifactType, BlobStore, DocPipeError, ProcessContext, QueueClient, QueueMessage, Result,
    dead_letter_queue_name, request_queue_name,
};
use serde_json::Value;
use tracing::{debug, error, info, instrument, warn};

use crate::content_process::{self, ContentProcess};
use crate::pipeline::{FileEntry, Pipeline, STATUS_COMPLETED, StepResult, format_elapsed};
use crate::sequencer::get_next_step_name;

/// Step-specific logic run by a [`Handler`].
///
/// Redelivery means `execute` can run more than once for the same work
/// item, so implementations must converge when re-run.
#[async_trait]
pub trait Executable: Send + Sync {
    async fn execute(&self, context: &mut MessageContext) -> Result<StepResult>;
}

/// Everything a step sees while handling one message.
pub struct MessageContext {
    pub step_name: String,
    pub message: QueueMessage,
    pub pipeline: Pipeline,
    pub ctx: Arc<ProcessContext>,
}

impl MessageContext {
    pub fn process_id(&self) -> Result<&str> {
        self.pipeline.require_process_id()
    }

    pub fn blobs(&self) -> &dyn BlobStore {
        self.ctx.blobs.as_ref()
    }

    /// Download and decode the single file `processed_by` produced with
    /// `artifact_type`. No match is `NotFound`, several are `Ambiguous`.
    pub async fn download_output_file_to_json_string(
        &self,
        processed_by: &str,
        artifact_type: ArtifactType,
    ) -> Result<String> {
        let file = self.pipeline.find_single_file(processed_by, artifact_type)?;
        let bytes = file.download_stream(self.blobs()).await?;
        String::from_utf8(bytes).map_err(|e| {
            DocPipeError::parse(format!("Failed to parse {} as UTF-8: {e}", file.name))
        })
    }

    /// Write `value` as JSON file `name`, registered under the active step.
    pub async fn upload_output_json(
        &mut self,
        name: &str,
        artifact_type: ArtifactType,
        value: &Value,
    ) -> Result<FileEntry> {
        let text = serde_json::to_string_pretty(value)
            .map_err(|e| DocPipeError::step(&self.step_name, format!("serialize {name}: {e}")))?;
        let blobs = self.ctx.blobs.clone();
        let entry = self.pipeline.upsert_file(name, artifact_type);
        entry.upload_json_text(blobs.as_ref(), &text).await?;
        entry.add_log_entry(self.step_name.clone(), format!("wrote {} bytes", entry.size));
        Ok(entry.clone())
    }
}

/// What one receive/resolve cycle did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageOutcome {
    /// No visible message.
    Idle,
    /// Step finished; pipeline enqueued for `next`.
    Forwarded { next: String },
    /// Last step finished.
    Completed,
    /// Redelivery of an already finished step. Its hand-off is replayed
    /// when it was the latest step, then the message is acknowledged.
    Skipped,
    /// Retry bound exceeded; moved to the dead-letter queue.
    DeadLettered,
    /// Attempt failed; message left for redelivery.
    Failed { error: String },
}

pub struct Handler {
    step_name: String,
    ctx: Arc<ProcessContext>,
    executable: Arc<dyn Executable>,
    queue: Arc<dyn QueueClient>,
    dead_letter_queue: Arc<dyn QueueClient>,
}

impl Handler {
    /// Bind `executable` to the queues derived from `step_name`, creating them if needed.
    pub async fn new(
        ctx: Arc<ProcessContext>,
        step_name: impl Into<String>,
        executable: Arc<dyn Executable>,
    ) -> Result<Self> {
        let step_name = step_name.into();
        let queue = ctx
            .queues
            .create_or_get(&request_queue_name(&step_name))
            .await?;
        let dead_letter_queue = ctx
            .queues
            .create_or_get(&dead_letter_queue_name(&step_name))
            .await?;

        info!(step = %step_name, queue = %queue.name(), "handler initialized");
        Ok(Self {
            step_name,
            ctx,
            executable,
            queue,
            dead_letter_queue,
        })
    }

    pub fn step_name(&self) -> &str {
        &self.step_name
    }

    pub fn queue_name(&self) -> &str {
        self.queue.name()
    }

    pub fn dead_letter_queue_name(&self) -> &str {
        self.dead_letter_queue.name()
    }

    /// Log and return the approximate depth of the request queue.
    pub async fn show_queue_information(&self) -> Result<u64> {
        let count = self.queue.approximate_message_count().await?;
        info!(queue = %self.queue.name(), approximate_message_count = count, "queue information");
        Ok(count)
    }

    /// Poll until `shutdown` resolves.
    ///
    /// Sleeps for the configured interval whenever the queue is empty or a
    /// cycle errors. Shutdown may interrupt a message mid-flight; it is then
    /// redelivered like after a crash.
    #[instrument(skip_all, fields(step = %self.step_name))]
    pub async fn connect_queue<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let interval = self.ctx.configuration.queue.interval();
        self.show_queue_information().await?;

        loop {
            let outcome = tokio::select! {
                biased;
                _ = &mut shutdown => break,
                outcome = self.process_next_message() => outcome,
            };

            let idle = match outcome {
                Ok(MessageOutcome::Idle) => true,
                Ok(outcome) => {
                    debug!(?outcome, "message resolved");
                    false
                }
                Err(e) => {
                    error!(error = %e, "queue cycle failed");
                    true
                }
            };

            if idle {
                tokio::select! {
                    biased;
                    _ = &mut shutdown => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
        }

        info!("handler stopped");
        Ok(())
    }

    /// Run exactly one receive/resolve cycle.
    ///
    /// Step failures become [`MessageOutcome::Failed`]; only collaborator
    /// errors outside a message attempt are returned as `Err`.
    #[instrument(skip_all, fields(step = %self.step_name))]
    pub async fn process_next_message(&self) -> Result<MessageOutcome> {
        let queue_config = &self.ctx.configuration.queue;
        let received = tokio::time::timeout(
            queue_config.process_timeout(),
            self.queue.receive(queue_config.visibility_timeout()),
        )
        .await;

        let message = match received {
            Ok(result) => result?,
            Err(_) => {
                warn!(queue = %self.queue.name(), "receive timed out");
                return Ok(MessageOutcome::Idle);
            }
        };
        let Some(message) = message else {
            return Ok(MessageOutcome::Idle);
        };

        debug!(message_id = %message.id, dequeue_count = message.dequeue_count, "message received");

        if message.dequeue_count > queue_config.max_dequeue_count {
            self.dead_letter(&message).await?;
            return Ok(MessageOutcome::DeadLettered);
        }

        match self.handle_message(&message).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                error!(message_id = %message.id, error = %e, "message processing failed");
                self.record_status(&message, content_process::STATUS_ERROR, Some(e.to_string()))
                    .await;
                Ok(MessageOutcome::Failed {
                    error: e.to_string(),
                })
            }
        }
    }

    async fn handle_message(&self, message: &QueueMessage) -> Result<MessageOutcome> {
        let incoming = Pipeline::get_object(&message.body)?;
        let process_id = incoming.require_process_id()?.to_string();
        let blobs = self.ctx.blobs.as_ref();

        let mut pipeline = Pipeline::load_from_persistent_storage(blobs, &process_id)
            .await?
            .unwrap_or(incoming);

        let completed = &pipeline.pipeline_status.completed_steps;
        if completed.iter().any(|s| s == &self.step_name) {
            // The earlier attempt may have died between saving and forwarding.
            if completed.last() == Some(&self.step_name) {
                let replayed = self.advance(&pipeline, &process_id).await?;
                debug!(process_id = %process_id, ?replayed, "replayed hand-off of finished step");
            }
            info!(process_id = %process_id, message_id = %message.id, "step already completed, acknowledging redelivery");
            self.queue.delete(message).await?;
            return Ok(MessageOutcome::Skipped);
        }

        match pipeline.pipeline_status.remaining_steps.first() {
            Some(head) if head == &self.step_name => {}
            other => {
                return Err(DocPipeError::validation(format!(
                    "pipeline {process_id} is positioned at {other:?}, not '{}'",
                    self.step_name
                )));
            }
        }
        pipeline.pipeline_status.active_step = Some(self.step_name.clone());

        ContentProcess::set_status(
            self.ctx.documents.as_ref(),
            self.ctx.process_collection(),
            &process_id,
            &self.step_name,
            &self.step_name,
            None,
        )
        .await?;

        info!(process_id = %process_id, "executing step");
        let started = Instant::now();
        let mut context = MessageContext {
            step_name: self.step_name.clone(),
            message: message.clone(),
            pipeline,
            ctx: self.ctx.clone(),
        };
        let mut result = self.executable.execute(&mut context).await?;
        let mut pipeline = context.pipeline;

        result.process_id = Some(process_id.clone());
        result.step_name = Some(self.step_name.clone());
        if result.elapsed.is_none() {
            result.elapsed = Some(format_elapsed(started.elapsed()));
        }
        if result.status.is_none() {
            result.status = Some(STATUS_COMPLETED.to_string());
        }

        result.save_to_persistent_storage(blobs).await?;
        pipeline.pipeline_status.add_step_result(result);
        pipeline.pipeline_status.update_step()?;
        pipeline.save_to_persistent_storage(blobs).await?;

        let outcome = self.advance(&pipeline, &process_id).await?;
        self.queue.delete(message).await?;
        Ok(outcome)
    }

    /// Hand a saved pipeline to the next step's queue, or mark the work item
    /// completed when no step remains.
    async fn advance(&self, pipeline: &Pipeline, process_id: &str) -> Result<MessageOutcome> {
        let outcome = match get_next_step_name(&pipeline.pipeline_status) {
            Some(next) => {
                let next_queue = self
                    .ctx
                    .queues
                    .create_or_get(&request_queue_name(next))
                    .await?;
                let message_id = next_queue.enqueue(&pipeline.to_json()?).await?;
                info!(process_id = %process_id, next_step = next, message_id = %message_id, "forwarded");
                MessageOutcome::Forwarded {
                    next: next.to_string(),
                }
            }
            None => {
                ContentProcess::set_status(
                    self.ctx.documents.as_ref(),
                    self.ctx.process_collection(),
                    process_id,
                    content_process::STATUS_COMPLETED,
                    &self.step_name,
                    None,
                )
                .await?;
                info!(process_id = %process_id, "pipeline completed");
                MessageOutcome::Completed
            }
        };
        Ok(outcome)
    }

    async fn dead_letter(&self, message: &QueueMessage) -> Result<()> {
        warn!(
            message_id = %message.id,
            dequeue_count = message.dequeue_count,
            dead_letter_queue = %self.dead_letter_queue.name(),
            "retry bound exceeded, dead-lettering"
        );
        self.dead_letter_queue.enqueue(&message.body).await?;
        self.queue.delete(message).await?;
        self.record_status(
            message,
            content_process::STATUS_FAILED,
            Some(format!(
                "step '{}' exceeded {} attempts",
                self.step_name, self.ctx.configuration.queue.max_dequeue_count
            )),
        )
        .await;
        Ok(())
    }

    /// Best-effort status write for a message that may not even parse.
    async fn record_status(&self, message: &QueueMessage, status: &str, error: Option<String>) {
        let Ok(pipeline) = Pipeline::get_object(&message.body) else {
            return;
        };
        let Ok(process_id) = pipeline.require_process_id() else {
            return;
        };
        if let Err(e) = ContentProcess::set_status(
            self.ctx.documents.as_ref(),
            self.ctx.process_collection(),
            process_id,
            status,
            &self.step_name,
            error,
        )
        .await
        {
            warn!(process_id, error = %e, "failed to record process status");
        }
    }
}
