//! Application configuration for docpipe.
//!
//! The config file is passed explicitly with `--config`; without it the
//! default location `~/.docpipe/docpipe.toml` is used. CLI flags override
//! config file values, which override defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{DocPipeError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "docpipe.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".docpipe";

// ---------------------------------------------------------------------------
// Config structs (matching docpipe.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Pipeline step list.
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Queue polling and retry settings.
    #[serde(default)]
    pub queue: QueueConfig,

    /// Storage backend settings.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Document-store collections.
    #[serde(default)]
    pub documents: DocumentsConfig,

    /// Logging levels.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Process host settings.
    #[serde(default)]
    pub host: HostConfig,
}

/// `[pipeline]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Ordered step names fixed on every pipeline at ingestion.
    #[serde(default = "default_steps")]
    pub steps: Vec<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            steps: default_steps(),
        }
    }
}

fn default_steps() -> Vec<String> {
    ["extract", "map", "evaluate", "save"]
        .into_iter()
        .map(String::from)
        .collect()
}

/// `[queue]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Seconds between polls when the queue is idle.
    #[serde(default = "default_interval")]
    pub interval_secs: u64,

    /// Lease applied to a received message.
    #[serde(default = "default_visibility_timeout")]
    pub visibility_timeout_secs: u64,

    /// Upper bound on a single receive call.
    #[serde(default = "default_process_timeout")]
    pub process_timeout_secs: u64,

    /// Deliveries allowed before a message is dead-lettered.
    #[serde(default = "default_max_dequeue_count")]
    pub max_dequeue_count: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval(),
            visibility_timeout_secs: default_visibility_timeout(),
            process_timeout_secs: default_process_timeout(),
            max_dequeue_count: default_max_dequeue_count(),
        }
    }
}

impl QueueConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }

    pub fn process_timeout(&self) -> Duration {
        Duration::from_secs(self.process_timeout_secs)
    }
}

fn default_interval() -> u64 {
    5
}
fn default_visibility_timeout() -> u64 {
    300
}
fn default_process_timeout() -> u64 {
    30
}
fn default_max_dequeue_count() -> u32 {
    5
}

/// `[storage]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Local libSQL database file (`~` expands to the home directory).
    #[serde(default = "default_database_path")]
    pub database_path: String,

    /// Remote libSQL URL. Takes precedence over `database_path` when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_url: Option<String>,

    /// Name of the env var holding the remote auth token (never store the token itself).
    #[serde(default = "default_auth_token_env")]
    pub auth_token_env: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            database_url: None,
            auth_token_env: default_auth_token_env(),
        }
    }
}

impl StorageConfig {
    /// Resolve `database_path`, expanding a leading `~/`.
    pub fn resolved_database_path(&self) -> Result<PathBuf> {
        expand_home(&self.database_path)
    }
}

fn default_database_path() -> String {
    "~/.docpipe/docpipe.db".into()
}
fn default_auth_token_env() -> String {
    "DOCPIPE_DB_TOKEN".into()
}

/// `[documents]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentsConfig {
    /// Collection holding one status record per work item.
    #[serde(default = "default_process_collection")]
    pub process_collection: String,

    /// Collection holding registered schemas, keyed by `Id`.
    #[serde(default = "default_schema_collection")]
    pub schema_collection: String,
}

impl Default for DocumentsConfig {
    fn default() -> Self {
        Self {
            process_collection: default_process_collection(),
            schema_collection: default_schema_collection(),
        }
    }
}

fn default_process_collection() -> String {
    "Processes".into()
}
fn default_schema_collection() -> String {
    "Schemas".into()
}

/// `[logging]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Base level for docpipe crates.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Level applied to each entry of `packages`.
    #[serde(default = "default_package_level")]
    pub package_level: String,

    /// Third-party targets to quiet down.
    #[serde(default = "default_packages")]
    pub packages: Vec<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            package_level: default_package_level(),
            packages: default_packages(),
        }
    }
}

impl LoggingConfig {
    /// Build `EnvFilter` directives, e.g. `docpipe=info,libsql=warn`.
    pub fn filter_directives(&self, base_level: Option<&str>) -> String {
        let level = base_level.unwrap_or(&self.level);
        let mut directives = vec![format!("docpipe={level}")];
        directives.extend(
            self.packages
                .iter()
                .filter(|p| !p.trim().is_empty())
                .map(|p| format!("{}={}", p.trim(), self.package_level)),
        );
        directives.join(",")
    }
}

fn default_log_level() -> String {
    "info".into()
}
fn default_package_level() -> String {
    "warn".into()
}
fn default_packages() -> Vec<String> {
    vec!["libsql".into(), "hyper".into()]
}

/// `[host]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    /// Milliseconds between liveness checks of worker processes.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Executable launched per handler (defaults to the running binary).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_program: Option<String>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            worker_program: None,
        }
    }
}

impl HostConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

fn default_poll_interval() -> u64 {
    1000
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.docpipe/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| DocPipeError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the default config file (`~/.docpipe/docpipe.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the config from an explicit path, or from the default location.
///
/// An explicit path must exist; a missing default file yields defaults.
pub fn load_config(path: Option<&Path>) -> Result<AppConfig> {
    if let Some(path) = path {
        return load_config_from(path);
    }

    let path = config_file_path()?;
    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| DocPipeError::io(path, e))?;

    let config: AppConfig = toml::from_str(&content).map_err(|e| {
        DocPipeError::config(format!("failed to parse {}: {e}", path.display()))
    })?;
    validate_config(&config)?;
    Ok(config)
}

/// Reject configurations no pipeline can run with.
pub fn validate_config(config: &AppConfig) -> Result<()> {
    if config.pipeline.steps.is_empty() {
        return Err(DocPipeError::config("[pipeline] steps must not be empty"));
    }
    let mut seen = std::collections::HashSet::new();
    for step in &config.pipeline.steps {
        if step.trim().is_empty() {
            return Err(DocPipeError::config("[pipeline] step names must not be blank"));
        }
        if !seen.insert(step.as_str()) {
            return Err(DocPipeError::config(format!(
                "[pipeline] step '{step}' is listed more than once"
            )));
        }
    }
    if config.queue.max_dequeue_count == 0 {
        return Err(DocPipeError::config("[queue] max_dequeue_count must be at least 1"));
    }
    Ok(())
}

/// Write a default config file to `path` (or the default location).
/// Returns the path to the created file.
pub fn init_config(path: Option<&Path>) -> Result<PathBuf> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => config_file_path()?,
    };
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|e| DocPipeError::io(dir, e))?;
    }

    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| DocPipeError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| DocPipeError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

fn expand_home(raw: &str) -> Result<PathBuf> {
    match raw.strip_prefix("~/") {
        Some(rest) => {
            let home = dirs::home_dir()
                .ok_or_else(|| DocPipeError::config("could not determine home directory"))?;
            Ok(home.join(rest))
        }
        None => Ok(PathBuf::from(raw)),
    }
}
