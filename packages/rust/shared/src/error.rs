//! Error types for docpipe.
//!
//! Library crates use [`DocPipeError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all docpipe operations.
#[derive(Debug, thiserror::Error)]
pub enum DocPipeError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// A required identifier or field is missing or inconsistent.
    #[error("validation error: {message}")]
    Validation { message: String },

    /// Malformed external representation (e.g. pipeline JSON).
    #[error("parse error: {message}")]
    Parse { message: String },

    /// No matching record or artifact.
    #[error("not found: {message}")]
    NotFound { message: String },

    /// More than one artifact matched a lookup that expects exactly one.
    #[error("ambiguous lookup: {message}")]
    Ambiguous { message: String },

    /// A newer copy of the record was persisted by another attempt.
    #[error("conflict: {message}")]
    Conflict { message: String },

    /// Queue collaborator failure.
    #[error("queue error: {0}")]
    Queue(String),

    /// Blob or document storage failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// A step's `execute` failed.
    #[error("step '{step}' failed: {message}")]
    Step { step: String, message: String },

    /// Spawning or signalling a worker process failed.
    #[error("process '{name}' error: {message}")]
    Process { name: String, message: String },

    /// Extension point without a concrete backend.
    #[error("not implemented: {0}")]
    NotImplemented(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, DocPipeError>;

impl DocPipeError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Create a parse error from any displayable message.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse {
            message: msg.into(),
        }
    }

    /// Create a not-found error from any displayable message.
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound {
            message: msg.into(),
        }
    }

    pub fn ambiguous(msg: impl Into<String>) -> Self {
        Self::Ambiguous {
            message: msg.into(),
        }
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict {
            message: msg.into(),
        }
    }

    /// Attribute a failure to the step that raised it.
    pub fn step(step: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Step {
            step: step.into(),
            message: msg.into(),
        }
    }

    pub fn process(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Process {
            name: name.into(),
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether the error is a lookup miss rather than a hard failure.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}
