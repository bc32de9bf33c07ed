//! CLI command definitions, routing, and process initialization.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, WrapErr, eyre};
use docpipe_core::{
    ContentProcess, Handler, HandlerHostManager, HandlerTarget, Pipeline, Schema, StepRegistry,
    submit_document, worker_args,
};
use docpipe_shared::{
    AppConfig, Credential, DocPipeError, LoggingConfig, ProcessContext, dead_letter_queue_name,
    init_config, load_config, request_queue_name,
};
use docpipe_storage::Storage;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// docpipe: queue-driven multi-step document processing.
#[derive(Parser)]
#[command(
    name = "docpipe",
    version,
    about = "Run and operate a queue-driven, multi-step document-processing pipeline.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Config file (defaults to ~/.docpipe/docpipe.toml).
    #[arg(long, global = true, env = "DOCPIPE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

impl LogFormat {
    fn as_arg(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Json => "json",
        }
    }
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Supervise one worker process per configured step.
    Host,

    /// Run the queue handler for a single step.
    Worker {
        /// Step this worker handles.
        #[arg(long)]
        step: String,
    },

    /// Submit documents to the first step of the pipeline.
    Submit {
        /// Files to submit.
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Registered schema to map the documents onto.
        #[arg(long)]
        schema: Option<String>,
    },

    /// Show the status of a work item.
    Status {
        /// Work-item (process) id.
        process_id: String,

        /// Print the raw records as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Show approximate queue depths for every step.
    Queues,

    /// Schema registry management.
    Schema {
        #[command(subcommand)]
        action: SchemaAction,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Schema subcommands.
#[derive(Subcommand)]
pub(crate) enum SchemaAction {
    /// Register or replace a schema from a JSON record file.
    Register {
        /// File holding `{"Id": .., "ClassName": .., "Fields": [..]}`.
        file: PathBuf,
    },
    /// Show a registered schema.
    Show {
        /// Schema id.
        id: String,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Initialization
// ---------------------------------------------------------------------------

/// Install the global tracing subscriber.
///
/// `-v`/`-vv` raise the `docpipe` level above the configured one and
/// `RUST_LOG` overrides everything. Fails if a subscriber is already set.
pub(crate) fn init_tracing(
    verbose: u8,
    log_format: LogFormat,
    logging: &LoggingConfig,
) -> docpipe_shared::Result<()> {
    use tracing_subscriber::{EnvFilter, fmt};

    let base_level = match verbose {
        0 => None,
        1 => Some("debug"),
        _ => Some("trace"),
    };
    let directives = logging.filter_directives(base_level);

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directives));

    let installed = match log_format {
        LogFormat::Text => fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .try_init(),
        LogFormat::Json => fmt().json().with_env_filter(env_filter).try_init(),
    };
    installed.map_err(|e| DocPipeError::config(format!("logging already initialized: {e}")))
}

/// Load config and install logging. Runs once per process.
fn load_and_trace(cli: &Cli) -> Result<AppConfig> {
    let config = load_config(cli.config.as_deref())?;
    init_tracing(cli.verbose, cli.log_format, &config.logging)?;
    Ok(config)
}

/// Open the configured database, applying pending migrations.
async fn open_storage(config: &AppConfig) -> Result<(Storage, Option<Credential>)> {
    let credential = Credential::from_env(&config.storage.auth_token_env);
    let storage = Storage::open_configured(config, credential.as_ref())
        .await
        .wrap_err("failed to open storage")?;
    Ok((storage, credential))
}

/// Build the process context: config, logging, credential and storage.
pub(crate) async fn initialize(cli: &Cli) -> Result<Arc<ProcessContext>> {
    let config = load_and_trace(cli)?;
    let (storage, credential) = open_storage(&config).await?;
    Ok(Arc::new(storage.process_context(config, credential)))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for ctrl-c: {e}");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    match &cli.command {
        Command::Host => cmd_host(&cli).await,
        Command::Worker { step } => cmd_worker(&cli, step).await,
        Command::Submit { files, schema } => cmd_submit(&cli, files, schema.as_deref()).await,
        Command::Status { process_id, json } => cmd_status(&cli, process_id, *json).await,
        Command::Queues => cmd_queues(&cli).await,
        Command::Schema { action } => match action {
            SchemaAction::Register { file } => cmd_schema_register(&cli, file).await,
            SchemaAction::Show { id } => cmd_schema_show(&cli, id).await,
        },
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init(&cli),
            ConfigAction::Show => cmd_config_show(&cli),
        },
    }
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

/// Arguments every worker inherits from the host invocation.
fn inherited_args(cli: &Cli, step: &str) -> Vec<String> {
    let mut args = worker_args(step, cli.config.as_deref());
    args.push("--log-format".into());
    args.push(cli.log_format.as_arg().into());
    if cli.verbose > 0 {
        args.push(format!("-{}", "v".repeat(cli.verbose as usize)));
    }
    args
}

async fn cmd_host(cli: &Cli) -> Result<()> {
    let config = load_and_trace(cli)?;
    let registry = StepRegistry::builtin();
    for step in &config.pipeline.steps {
        registry.get(step)?;
    }

    let program = match &config.host.worker_program {
        Some(program) => PathBuf::from(program),
        None => std::env::current_exe().wrap_err("cannot locate the docpipe executable")?,
    };

    // Migrate once here so workers starting together find the schema in place.
    let (storage, _) = open_storage(&config).await?;
    info!(schema_version = storage.get_schema_version().await, "storage ready");
    drop(storage);

    let mut manager = HandlerHostManager::with_os_processes(config.host.poll_interval());
    for step in &config.pipeline.steps {
        manager.add_handler(
            step.clone(),
            HandlerTarget::worker(&program),
            inherited_args(cli, step),
        );
    }

    info!(
        program = %program.display(),
        steps = ?config.pipeline.steps,
        "starting process host"
    );
    manager.run(shutdown_signal()).await?;
    Ok(())
}

async fn cmd_worker(cli: &Cli, step: &str) -> Result<()> {
    let ctx = initialize(cli).await?;
    if !ctx.steps().iter().any(|s| s == step) {
        return Err(eyre!(
            "step '{step}' is not in [pipeline] steps ({})",
            ctx.steps().join(", ")
        ));
    }

    let executable = StepRegistry::builtin().get(step)?;
    let handler = Handler::new(ctx, step, executable).await?;
    handler.connect_queue(shutdown_signal()).await?;
    Ok(())
}

async fn cmd_submit(cli: &Cli, files: &[PathBuf], schema_id: Option<&str>) -> Result<()> {
    let ctx = initialize(cli).await?;

    let bar = ProgressBar::new(files.len() as u64);
    bar.set_style(
        ProgressStyle::with_template("{bar:30.cyan/blue} {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );

    let mut submitted = Vec::new();
    for path in files {
        let name = file_name(path)?;
        bar.set_message(name.clone());
        let bytes = tokio::fs::read(path)
            .await
            .wrap_err_with(|| format!("cannot read {}", path.display()))?;
        let submission = submit_document(&ctx, &name, &bytes, schema_id).await?;
        submitted.push((name, submission));
        bar.inc(1);
    }
    bar.finish_and_clear();

    println!();
    for (name, submission) in &submitted {
        println!("  {name}");
        println!("    Process ID: {}", submission.process_id);
        println!("    Queue:      {}", submission.queue_name);
    }
    println!();
    Ok(())
}

fn file_name(path: &Path) -> Result<String> {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .ok_or_else(|| eyre!("'{}' has no file name", path.display()))
}

async fn cmd_status(cli: &Cli, process_id: &str, as_json: bool) -> Result<()> {
    let ctx = initialize(cli).await?;
    let record =
        ContentProcess::load(ctx.documents.as_ref(), ctx.process_collection(), process_id).await?;
    let pipeline = Pipeline::load_from_persistent_storage(ctx.blobs.as_ref(), process_id).await?;

    if record.is_none() && pipeline.is_none() {
        return Err(eyre!("no work item with id '{process_id}'"));
    }

    if as_json {
        let out = serde_json::json!({ "process": record, "pipeline": pipeline });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!("  Process ID: {process_id}");
    if let Some(record) = &record {
        println!("  File:       {}", record.processed_file_name.as_deref().unwrap_or("-"));
        println!("  Status:     {}", record.status.as_deref().unwrap_or("-"));
        if let Some(schema_id) = &record.schema_id {
            println!("  Schema:     {schema_id}");
        }
        if let Some(error) = &record.error {
            println!("  Error:      {error}");
        }
    }
    if let Some(pipeline) = &pipeline {
        let status = &pipeline.pipeline_status;
        println!("  Active:     {}", status.active_step.as_deref().unwrap_or("-"));
        println!("  Completed:  {}", status.completed_steps.join(", "));
        println!("  Remaining:  {}", status.remaining_steps.join(", "));
        println!("  Done:       {}", status.completed);
        for result in &status.process_results {
            println!(
                "    {:<10} {:<10} {}",
                result.step_name.as_deref().unwrap_or("?"),
                result.status.as_deref().unwrap_or("-"),
                result.elapsed.as_deref().unwrap_or("-"),
            );
        }
    }
    println!();
    Ok(())
}

async fn cmd_queues(cli: &Cli) -> Result<()> {
    let ctx = initialize(cli).await?;

    println!();
    println!("  {:<12} {:>8} {:>12}", "STEP", "QUEUED", "DEAD-LETTER");
    for step in ctx.steps() {
        let queue = ctx.queues.create_or_get(&request_queue_name(step)).await?;
        let dead = ctx
            .queues
            .create_or_get(&dead_letter_queue_name(step))
            .await?;
        println!(
            "  {:<12} {:>8} {:>12}",
            step,
            queue.approximate_message_count().await?,
            dead.approximate_message_count().await?
        );
    }
    println!();
    Ok(())
}

async fn cmd_schema_register(cli: &Cli, file: &Path) -> Result<()> {
    let ctx = initialize(cli).await?;
    let text = tokio::fs::read_to_string(file)
        .await
        .wrap_err_with(|| format!("cannot read {}", file.display()))?;
    let mut schema: Schema = serde_json::from_str(&text)
        .wrap_err_with(|| format!("{} is not a schema record", file.display()))?;
    schema
        .register(ctx.documents.as_ref(), ctx.schema_collection())
        .await?;
    println!("Schema '{}' registered ({} fields)", schema.id, schema.fields.len());
    Ok(())
}

async fn cmd_schema_show(cli: &Cli, id: &str) -> Result<()> {
    let ctx = initialize(cli).await?;
    let schema =
        Schema::get_schema(ctx.documents.as_ref(), ctx.schema_collection(), Some(id)).await?;
    println!("{}", serde_json::to_string_pretty(&schema)?);
    Ok(())
}

fn cmd_config_init(cli: &Cli) -> Result<()> {
    let path = init_config(cli.config.as_deref())?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

fn cmd_config_show(cli: &Cli) -> Result<()> {
    let config = load_and_trace(cli)?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_worker_with_global_flags() {
        let cli = Cli::try_parse_from([
            "docpipe",
            "worker",
            "--step",
            "extract",
            "--config",
            "/tmp/docpipe.toml",
            "--log-format",
            "json",
            "-vv",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.log_format, LogFormat::Json);
        assert_eq!(cli.config.as_deref(), Some(Path::new("/tmp/docpipe.toml")));
        assert!(matches!(cli.command, Command::Worker { ref step } if step == "extract"));
    }

    #[test]
    fn submit_requires_files() {
        assert!(Cli::try_parse_from(["docpipe", "submit"]).is_err());
    }

    #[test]
    fn host_forwards_flags_to_workers() {
        let cli = Cli::try_parse_from(["docpipe", "host", "--config", "/etc/dp.toml", "-v"]).unwrap();
        assert_eq!(
            inherited_args(&cli, "map"),
            vec![
                "--step",
                "map",
                "--config",
                "/etc/dp.toml",
                "--log-format",
                "text",
                "-v"
            ]
        );
    }

    #[test]
    fn submit_accepts_schema() {
        let cli = Cli::try_parse_from(["docpipe", "submit", "a.txt", "--schema", "invoice"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::Submit { ref files, schema: Some(ref schema) }
                if files.len() == 1 && schema == "invoice"
        ));
    }

    #[test]
    fn parses_schema_subcommands() {
        let cli = Cli::try_parse_from(["docpipe", "schema", "show", "invoice"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::Schema { action: SchemaAction::Show { ref id } } if id == "invoice"
        ));
        assert!(Cli::try_parse_from(["docpipe", "schema", "register"]).is_err());
    }

    #[tokio::test]
    async fn host_storage_is_migrated_before_workers_open_it() {
        let path = std::env::temp_dir().join(format!("docpipe_cli_{}.db", std::process::id()));
        let _ = std::fs::remove_file(&path);
        let mut config = AppConfig::default();
        config.storage.database_path = path.display().to_string();

        let (storage, _) = open_storage(&config).await.unwrap();
        assert!(path.exists());
        assert_eq!(storage.get_schema_version().await, 1);
        drop(storage);

        let (worker, _) = open_storage(&config).await.unwrap();
        assert_eq!(worker.get_schema_version().await, 1);
    }

    #[test]
    fn tracing_installs_once() {
        let logging = LoggingConfig::default();
        // another test in this binary may have installed it first
        let _ = init_tracing(0, LogFormat::Text, &logging);
        let err = init_tracing(0, LogFormat::Text, &logging).unwrap_err();
        assert!(matches!(err, DocPipeError::Config { .. }));
    }
}
