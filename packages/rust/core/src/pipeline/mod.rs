//! Pipeline entities: step results, status state machine, artifacts,
//! registered schemas and the work-item aggregate.

mod data;
mod file;
mod schema;
mod status;
mod step_result;

pub use data::Pipeline;
pub use file::{FileEntry, JSON_MIME_TYPE, LogEntry};
pub use schema::Schema;
pub use status::{PIPELINE_STATUS_BLOB_NAME, PipelineStatus};
pub use step_result::{STATUS_COMPLETED, StepResult, format_elapsed};
