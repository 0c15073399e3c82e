//! execq CLI: operator interface to the execution queue.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use execq::client::HttpExecutionClient;
use execq::config::Config;
use execq::driver::{QueueRunner, RunConfig, RunSummary};
use execq::gate::{PauseGate, SystemClock};
use execq::model::Payload;
use execq::store::WorkItemStore;
use execq::telemetry::{TelemetryConfig, TelemetryGuard, init_telemetry};
use execq::tracking::{FailureLog, JsonTrackingFile};

#[derive(Parser)]
#[command(name = "execq", about = "Durable execution queue for remote pipelines")]
struct Cli {
    /// Optional TOML config file; environment variables override it
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Build a new queue from a JSON array of execution requests and run it
    Run {
        /// File holding the JSON array of payloads
        #[arg(long)]
        input: PathBuf,
        /// Override the configured maximum number of concurrent executions
        #[arg(long)]
        max_thread: Option<usize>,
    },
    /// Resume an interrupted queue from its save file
    Resume {
        #[arg(long)]
        max_thread: Option<usize>,
    },
    /// Show progress of the current queue without touching it
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Command::Run { input, max_thread } => cmd_run(&config, input, max_thread).await,
        Command::Resume { max_thread } => cmd_resume(&config, max_thread).await,
        Command::Status => cmd_status(&config).await,
    }
}

fn telemetry(config: &Config) -> anyhow::Result<TelemetryGuard> {
    Ok(init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "execq".to_string(),
        default_level: config.log_level.clone(),
    })?)
}

fn build_runner(
    config: &Config,
    client: Arc<HttpExecutionClient>,
    max_thread: Option<usize>,
) -> QueueRunner {
    let mut run_config = RunConfig::from_config(config);
    if let Some(n) = max_thread {
        run_config.max_workers = n.max(1);
    }

    let runner = QueueRunner::new(
        WorkItemStore::new(config.store_paths()),
        client,
        Arc::new(JsonTrackingFile::new(config.tracking_file.clone())),
        run_config,
    )
    .with_failure_log(FailureLog::new(config.error_file.clone()));

    match config.pause_window {
        Some(window) => runner.with_gate(PauseGate::new(window, Arc::new(SystemClock))),
        None => runner,
    }
}

async fn cmd_run(config: &Config, input: PathBuf, max_thread: Option<usize>) -> anyhow::Result<()> {
    let _guard = telemetry(config)?;

    let store = WorkItemStore::new(config.store_paths());
    if store.working_exists().await {
        anyhow::bail!(
            "a queue is already in progress at {}; use `execq resume` to continue it",
            store.paths().working.display()
        );
    }

    let text = tokio::fs::read_to_string(&input)
        .await
        .with_context(|| format!("cannot read {}", input.display()))?;
    let content: Vec<Payload> = serde_json::from_str(&text)
        .with_context(|| format!("{} is not a JSON array of objects", input.display()))?;

    let client = Arc::new(HttpExecutionClient::from_config(config)?);
    let runner = build_runner(config, client, max_thread);
    interruptible(&runner, runner.init_queue(content)).await
}

async fn cmd_resume(config: &Config, max_thread: Option<usize>) -> anyhow::Result<()> {
    let _guard = telemetry(config)?;

    let client = Arc::new(HttpExecutionClient::from_config(config)?);
    let token = client.current_refresh_token().await?;
    let runner = build_runner(config, client, max_thread);
    interruptible(&runner, runner.resume_queue(Some(&token))).await
}

async fn cmd_status(config: &Config) -> anyhow::Result<()> {
    let store = WorkItemStore::new(config.store_paths());
    let (source, snapshot) = if store.working_exists().await {
        (&store.paths().working, store.load().await?)
    } else if store.save_exists().await {
        (&store.paths().save, store.load_save().await?)
    } else {
        println!("No queue in progress.");
        return Ok(());
    };

    println!("Queue:      {}", source.display());
    println!("Processed:  {}", snapshot.state.nb_processed_items);
    println!("Remaining:  {}", snapshot.items.len());
    println!("Total:      {}", snapshot.total_items());
    if let Some(next) = snapshot.items.first() {
        println!("Next:       {}", next.identifier);
    }
    Ok(())
}

/// Drive a queue run. Ctrl-C asks the runner to stop and the run is still
/// awaited, so in-flight bookkeeping lands on disk before exit and the queue
/// can be resumed.
async fn interruptible<F>(runner: &QueueRunner, run: F) -> anyhow::Result<()>
where
    F: std::future::Future<Output = execq::error::Result<RunSummary>>,
{
    tokio::pin!(run);
    tokio::select! {
        summary = &mut run => {
            print_summary(&summary?);
            return Ok(());
        }
        _ = tokio::signal::ctrl_c() => runner.shutdown(),
    }

    let summary = run.await?;
    print_summary(&summary);
    anyhow::bail!("interrupted, run `execq resume` to continue the queue")
}

fn print_summary(summary: &RunSummary) {
    println!(
        "{} processed this run ({} succeeded, {} failed), {} items in total",
        summary.processed_this_run, summary.succeeded, summary.failed, summary.total_items
    );
}
