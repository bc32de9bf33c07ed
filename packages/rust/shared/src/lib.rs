//! Shared types, error model, configuration and collaborator interfaces for docpipe.
//!
//! This crate is the foundation depended on by all other docpipe crates.
//! It provides:
//! - [`DocPipeError`], the unified error type
//! - Domain types ([`ArtifactType`]) and queue/blob naming conventions
//! - Configuration ([`AppConfig`], config loading)
//! - Collaborator traits ([`QueueService`], [`BlobStore`], [`DocumentStore`])
//! - [`ProcessContext`], the explicit per-process context

pub mod config;
pub mod context;
pub mod error;
pub mod ports;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, DocumentsConfig, HostConfig, LoggingConfig, PipelineConfig, QueueConfig,
    StorageConfig, config_dir, config_file_path, init_config, load_config, load_config_from,
    validate_config,
};
pub use context::{Credential, ProcessContext};
pub use error::{DocPipeError, Result};
pub use ports::{
    BlobStore, DocumentStore, QueueClient, QueueMessage, QueueService, matches_filter,
};
pub use types::{
    ArtifactType, PIPELINE_BLOB_NAME, dead_letter_queue_name, new_process_id,
    request_queue_name, step_result_blob_name,
};
