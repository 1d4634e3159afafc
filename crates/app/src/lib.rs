use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use clipflow_core::config::{config_path, data_dir, initialize_data_dir, AppConfig};
use clipflow_core::executor::{
    prepare, ExecutionProgress, ExecutionRequest, ExecutionStatus, PreparedRun, ProgressCallback,
    WorkflowExecutor,
};
use clipflow_core::ledger::{CreditLedger, MemoryLedger, TransactionType};
use clipflow_core::logging::{
    self, FileSinkPlan, LoggingInitOptions, PanicHookInstallPlan, RedactingMakeWriter,
    DEFAULT_LOG_FILTER,
};
use clipflow_core::model_runner::ReplicateRunner;
use clipflow_core::server::{app_router, AppState};

const CLI_USER_ID: &str = "cli";
const DEFAULT_CLI_BALANCE: i64 = 1000;

#[derive(Parser)]
#[command(
    name = "clipflow",
    about = "Workflow execution engine for AI-assisted video content",
    args_conflicts_with_subcommands = true
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    serve: ServeArgs,

    #[arg(
        short = 'v',
        long = "verbose",
        action = ArgAction::Count,
        global = true,
        help = "Increase log verbosity (-v: debug, -vv: trace)"
    )]
    verbose: u8,

    #[arg(
        long = "log-filter",
        value_name = "FILTER",
        global = true,
        help = "Explicit tracing filter (overrides RUST_LOG and -v)"
    )]
    log_filter: Option<String>,

    #[arg(long, global = true, help = "Data directory (config, database, logs)")]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP API (default when no subcommand is given)
    Serve(ServeArgs),
    /// Execute a workflow file once against the Replicate runner
    Run(RunArgs),
    /// Validate a workflow file and print its generations and estimated cost
    Plan(PlanArgs),
}

#[derive(Args)]
struct ServeArgs {
    #[arg(short, long)]
    port: Option<u16>,

    #[arg(long)]
    host: Option<String>,
}

#[derive(Args)]
struct RunArgs {
    #[arg(help = "Path to workflow JSON file")]
    workflow: PathBuf,
    #[arg(
        short = 'i',
        long = "input",
        value_name = "KEY=VALUE",
        help = "Value for an input node, keyed by its name (repeatable)"
    )]
    inputs: Vec<String>,
    #[arg(
        short = 't',
        long = "target",
        value_name = "NODE_ID",
        help = "Only run this node and its ancestors (repeatable)"
    )]
    targets: Vec<String>,
    #[arg(long, default_value_t = DEFAULT_CLI_BALANCE, help = "Credits available to this run")]
    balance: i64,
}

#[derive(Args)]
struct PlanArgs {
    #[arg(help = "Path to workflow JSON file")]
    workflow: PathBuf,
    #[arg(short = 't', long = "target", value_name = "NODE_ID")]
    targets: Vec<String>,
}

pub async fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    init_logging(&resolved_data_dir, cli.verbose, cli.log_filter.as_deref());
    info!(
        pid = std::process::id(),
        data_dir = %resolved_data_dir.display(),
        config_path = %config_path(&resolved_data_dir).display(),
        "Runtime startup metadata"
    );

    match cli.command {
        Some(Commands::Serve(args)) => run_server(args, resolved_data_dir).await,
        Some(Commands::Run(args)) => run_workflow(args, &resolved_data_dir).await,
        Some(Commands::Plan(args)) => plan_workflow(args, &resolved_data_dir),
        None => run_server(cli.serve, resolved_data_dir).await,
    }
}

fn init_logging(data_dir: &Path, verbose: u8, cli_log_filter: Option<&str>) {
    let panic_hook_plan = logging::install_panic_hook(Some(data_dir));
    if let PanicHookInstallPlan::Fallback { reason } = &panic_hook_plan {
        eprintln!("Warning: panic crash artifacts unavailable ({reason}).");
    }

    let options = LoggingInitOptions {
        data_dir: Some(data_dir.to_path_buf()),
        verbose,
        cli_log_filter: cli_log_filter.map(ToString::to_string),
        rust_log_env: std::env::var("RUST_LOG").ok(),
        ..Default::default()
    };
    let filters = logging::compose_logging_filters(&options);
    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(RedactingMakeWriter::new(std::io::stderr))
        .with_filter(parse_env_filter_with_fallback(&filters.console_filter, "console"));

    match logging::build_file_sink_plan(&options) {
        FileSinkPlan::Ready { appender, .. } => {
            let file_layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(RedactingMakeWriter::new(appender))
                .with_filter(parse_env_filter_with_fallback(&filters.file_filter, "file"));
            let subscriber = tracing_subscriber::registry()
                .with(console_layer)
                .with(file_layer);
            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!("Failed to initialize tracing subscriber: {error}.");
            }
        }
        FileSinkPlan::Fallback {
            attempted_log_dir,
            reason,
        } => {
            let subscriber = tracing_subscriber::registry().with(console_layer);
            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!("Failed to initialize tracing subscriber: {error}.");
                return;
            }
            warn!(
                attempted_log_dir = ?attempted_log_dir,
                reason = %reason,
                "Persistent file logging unavailable; continuing with console-only logging"
            );
        }
    }
}

fn parse_env_filter_with_fallback(filter: &str, sink_name: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_new(filter).unwrap_or_else(|error| {
        eprintln!(
            "Invalid {sink_name} log filter '{filter}': {error}. Falling back to '{DEFAULT_LOG_FILTER}'."
        );
        tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)
    })
}

fn load_config(data_dir: &Path) -> AppConfig {
    if let Err(err) = initialize_data_dir(data_dir) {
        warn!(error = %err, "Failed to initialize data directory");
    }
    match AppConfig::load_from_path(&config_path(data_dir)) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %err, "Failed to load config file, using defaults");
            AppConfig::default()
        }
    }
}

async fn run_server(args: ServeArgs, data_dir: PathBuf) -> Result<()> {
    let config = load_config(&data_dir);
    let port = args
        .port
        .or_else(|| std::env::var("PORT").ok().and_then(|v| v.parse().ok()))
        .unwrap_or(config.server.port);
    let host = args.host.unwrap_or_else(|| config.server.host.clone());

    let state = AppState::from_config(&config, &data_dir)?;
    let app = app_router(state);

    let addr = format!("{host}:{port}");
    info!(%addr, "Starting clipflow server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn read_workflow(path: &Path) -> Result<serde_json::Value> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read workflow file: {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("workflow file is not valid JSON: {}", path.display()))
}

/// `KEY=VALUE` pairs. Values that parse as JSON keep their type; anything else is a string.
fn parse_inputs(pairs: &[String]) -> Result<serde_json::Map<String, serde_json::Value>> {
    let mut inputs = serde_json::Map::new();
    for pair in pairs {
        let Some((key, raw)) = pair.split_once('=') else {
            bail!("invalid --input '{pair}': expected KEY=VALUE");
        };
        let key = key.trim();
        if key.is_empty() {
            bail!("invalid --input '{pair}': key must not be empty");
        }
        let value = serde_json::from_str(raw)
            .unwrap_or_else(|_| serde_json::Value::String(raw.to_string()));
        inputs.insert(key.to_string(), value);
    }
    Ok(inputs)
}

fn targets_option(targets: Vec<String>) -> Option<Vec<String>> {
    if targets.is_empty() {
        None
    } else {
        Some(targets)
    }
}

async fn run_workflow(args: RunArgs, data_dir: &Path) -> Result<()> {
    let config = load_config(data_dir);
    let document = read_workflow(&args.workflow)?;
    let request = ExecutionRequest {
        input_data: parse_inputs(&args.inputs)?,
        target_node_ids: targets_option(args.targets),
    };

    let runner = ReplicateRunner::from_config(&config.replicate)
        .context("failed to configure Replicate model runner")?;
    let ledger = Arc::new(MemoryLedger::new());
    if args.balance > 0 {
        ledger.grant(CLI_USER_ID, args.balance, TransactionType::Bonus, "CLI run balance")?;
    }
    let executor = WorkflowExecutor::new(
        Arc::new(runner),
        Arc::new(config.model_catalog()),
        ledger,
    );

    let cancel = CancellationToken::new();
    let ctrl_c_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Cancelling after the current generation...");
            ctrl_c_cancel.cancel();
        }
    });

    let progress: ProgressCallback = Arc::new(|progress: ExecutionProgress| {
        eprintln!(
            "[{}/{}] credits used: {}",
            progress.completed_generations, progress.total_generations, progress.credits_used
        );
    });

    info!(workflow = %args.workflow.display(), "Running workflow");
    let report = executor
        .execute(CLI_USER_ID, &document, &request, cancel, Some(progress))
        .await;

    println!("{}", serde_json::to_string_pretty(&report)?);
    match report.status {
        ExecutionStatus::Completed => Ok(()),
        status => bail!(
            "workflow {status}: {}",
            report.error_message.as_deref().unwrap_or("no error message")
        ),
    }
}

fn plan_workflow(args: PlanArgs, data_dir: &Path) -> Result<()> {
    let config = load_config(data_dir);
    let document = read_workflow(&args.workflow)?;
    let targets = targets_option(args.targets);
    let prepared = prepare(&document, targets.as_deref(), &config.model_catalog())?;
    print!("{}", format_plan(&prepared));
    Ok(())
}

fn format_plan(prepared: &PreparedRun) -> String {
    let mut out = String::new();
    for (idx, generation) in prepared.plan.generations.iter().enumerate() {
        let members: Vec<String> = generation
            .iter()
            .map(|id| match prepared.graph.node(id) {
                Some(node) => format!("{id} ({})", node.kind),
                None => id.clone(),
            })
            .collect();
        let _ = writeln!(out, "generation {idx}: {}", members.join(", "));
    }
    let _ = writeln!(out, "estimated cost: {} credits", prepared.estimated_cost);
    out
}
