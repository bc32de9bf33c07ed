//! Core pipeline logic for docpipe.
//!
//! Pipeline entities and their state machine, the per-step queue handler
//! protocol, the built-in steps with their confidence comparison, document
//! ingestion and the process supervisor that keeps one worker alive per step.

pub mod comparison;
pub mod content_process;
pub mod handler;
pub mod ingest;
pub mod pipeline;
pub mod process_host;
pub mod sequencer;
pub mod steps;

pub use comparison::{
    ExtractionComparisonData, ExtractionComparisonItem, get_extraction_comparison_data,
};
pub use content_process::{ContentProcess, StepOutput};
pub use handler::{Executable, Handler, MessageContext, MessageOutcome};
pub use ingest::{Submission, submit_document};
pub use pipeline::{FileEntry, LogEntry, Pipeline, PipelineStatus, Schema, StepResult};
pub use process_host::{
    HandlerHostManager, HandlerInfo, HandlerTarget, OsProcessSpawner, ProcessHandle,
    ProcessSpawner, worker_args,
};
pub use sequencer::get_next_step_name;
pub use steps::StepRegistry;
