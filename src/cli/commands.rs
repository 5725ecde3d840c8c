//! CLI command definitions for agent-vm-runner.
//!
//! `run` executes a dataset of tasks against Docker-backed environments;
//! `submissions` inspects a submission log left by a previous run.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::metrics::RunnerMetrics;
use crate::runner::{
    DockerProvider, DockerProviderConfig, RunnerConfig, SubmissionLog, Task, TaskDriver,
    TaskOutcome,
};
use crate::scheduler::{BatchScheduler, BatchSummary};

/// Run an AI agent against benchmark tasks, one isolated environment per task.
#[derive(Parser)]
#[command(name = "agent-vm-runner")]
#[command(about = "Run an AI agent against benchmark tasks in ephemeral environments")]
#[command(version)]
#[command(
    long_about = "agent-vm-runner provisions one ephemeral environment per task, runs the agent in it, and records every outcome to an append-only submission log.\n\nExample usage:\n  agent-vm-runner run tasks.json --benchmark usaco --max-concurrent 4 --agent-dir ./my-agent"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run every task of a dataset and record the outcomes.
    Run(Box<RunArgs>),

    /// Summarize a submission log.
    #[command(alias = "subs")]
    Submissions(SubmissionsArgs),
}

/// Arguments for `agent-vm-runner run`.
///
/// Unset options fall back to `AGENT_RUNNER_*` and `AGENT_DOCKER_*`
/// environment variables, then to built-in defaults.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Dataset JSON file: an object mapping task id to input payload.
    #[arg(env = "AGENT_RUNNER_DATASET")]
    pub dataset: PathBuf,

    /// Benchmark name, used in environment names.
    #[arg(short = 'b', long)]
    pub benchmark: Option<String>,

    /// Run identifier. Reuse a previous one with --resume to continue it.
    #[arg(long, env = "AGENT_RUNNER_RUN_ID")]
    pub run_id: Option<String>,

    /// Directory for the submission log, agent logs and artifacts.
    #[arg(long)]
    pub log_dir: Option<PathBuf>,

    /// Maximum number of environments alive at once.
    #[arg(short = 'c', long)]
    pub max_concurrent: Option<usize>,

    /// Per-task timeout in seconds.
    #[arg(short = 't', long)]
    pub timeout: Option<u64>,

    /// Seconds between completion checks.
    #[arg(long)]
    pub poll_interval: Option<u64>,

    /// Local directory with the agent's code.
    #[arg(short = 'a', long)]
    pub agent_dir: Option<PathBuf>,

    /// Agent entrypoint, e.g. `main.run`.
    #[arg(short = 'e', long)]
    pub entrypoint: Option<String>,

    /// Agent arguments as a JSON object, written to `agent_args.json`.
    #[arg(long)]
    pub agent_args: Option<String>,

    /// Setup script run in every environment before the agent.
    #[arg(long)]
    pub setup_script: Option<PathBuf>,

    /// Remote user the agent runs as.
    #[arg(long)]
    pub remote_user: Option<String>,

    /// Network policy applied to every environment (Docker network name).
    #[arg(long)]
    pub network: Option<String>,

    /// Do not copy remote workspaces back after each task.
    #[arg(long)]
    pub no_artifacts: bool,

    /// Skip tasks already recorded in this run's submission log.
    #[arg(long, requires = "run_id")]
    pub resume: bool,

    /// Docker image for CPU tasks.
    #[arg(long)]
    pub image: Option<String>,

    /// Docker image for GPU tasks.
    #[arg(long)]
    pub gpu_image: Option<String>,

    /// Command that starts the agent inside the environment.
    #[arg(long)]
    pub launch_command: Option<String>,

    /// Write the result mapping to this file.
    #[arg(short = 'o', long)]
    pub output: Option<PathBuf>,

    /// Write Prometheus metrics for the run to this file.
    #[arg(long)]
    pub metrics_file: Option<PathBuf>,

    /// Print the result mapping as JSON to stdout instead of a summary.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `agent-vm-runner submissions`.
#[derive(Parser, Debug)]
pub struct SubmissionsArgs {
    /// Path to a `{run_id}_RAW_SUBMISSIONS.jsonl` file.
    pub path: PathBuf,

    /// Print the reconstructed result mapping as JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Run(args) => run_batch_command(*args).await,
        Commands::Submissions(args) => run_submissions_command(args),
    }
}

// ============================================================================
// Run Command Implementation
// ============================================================================

async fn run_batch_command(args: RunArgs) -> anyhow::Result<()> {
    let tasks = load_dataset(&args.dataset)?;
    if tasks.is_empty() {
        warn!(dataset = %args.dataset.display(), "Dataset contains no tasks");
    }

    let config = build_runner_config(&args)?;
    config.validate().context("Invalid runner configuration")?;
    if !config.agent_dir.is_dir() {
        anyhow::bail!(
            "Agent directory does not exist: {}",
            config.agent_dir.display()
        );
    }

    let docker_config = build_docker_config(&args)?;
    docker_config
        .validate()
        .context("Invalid Docker configuration")?;
    let provider = DockerProvider::new(docker_config);
    provider
        .check_available()
        .await
        .context("Docker is not available")?;

    let recorded = if args.resume {
        let recorded = SubmissionLog::load(&config.submissions_path())
            .context("Failed to read submission log for resume")?;
        info!(recorded = recorded.len(), "Loaded recorded submissions");
        Some(recorded)
    } else {
        None
    };

    info!(
        run_id = %config.run_id,
        benchmark = %config.benchmark_name,
        tasks = tasks.len(),
        submissions = %config.submissions_path().display(),
        "Starting run"
    );

    let metrics = Arc::new(RunnerMetrics::new().context("Failed to register metrics")?);
    let config = Arc::new(config);
    let driver = Arc::new(TaskDriver::new(
        Arc::new(provider),
        Arc::clone(&config),
        Arc::clone(&metrics),
    ));
    let scheduler = BatchScheduler::from_driver(driver);

    let results = match recorded {
        Some(recorded) => scheduler.run_batch_resuming(tasks, recorded).await,
        None => scheduler.run_batch(tasks).await,
    };

    if let Some(path) = &args.metrics_file {
        write_file(path, &metrics.export())?;
        info!(path = %path.display(), "Metrics written");
    }

    let rendered = render_results(&results)?;
    if let Some(path) = &args.output {
        write_file(path, &rendered)?;
        info!(path = %path.display(), "Results written");
    }

    if args.json {
        println!("{rendered}");
    } else {
        print_summary(
            &BatchSummary::from_outcomes(results.values()),
            &config.submissions_path(),
        );
    }

    Ok(())
}

/// Loads a dataset file mapping task id to input payload.
fn load_dataset(path: &Path) -> anyhow::Result<Vec<Task>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read dataset {}", path.display()))?;
    parse_dataset(&content).with_context(|| format!("Invalid dataset {}", path.display()))
}

fn parse_dataset(content: &str) -> anyhow::Result<Vec<Task>> {
    let value: Value = serde_json::from_str(content)?;
    match value {
        Value::Object(entries) => Ok(entries
            .into_iter()
            .map(|(id, input)| Task::from_entry(id, input))
            .collect()),
        _ => anyhow::bail!("dataset must be a JSON object mapping task id to input"),
    }
}

fn build_runner_config(args: &RunArgs) -> anyhow::Result<RunnerConfig> {
    let mut config = RunnerConfig::from_env().context("Invalid AGENT_RUNNER_* variable")?;

    if let Some(benchmark) = &args.benchmark {
        config = config.with_benchmark(benchmark.clone());
    }
    if let Some(run_id) = &args.run_id {
        config = config.with_run_id(run_id.clone());
    }
    if let Some(dir) = &args.log_dir {
        config = config.with_log_dir(dir.clone());
    }
    if let Some(max) = args.max_concurrent {
        config = config.with_max_concurrent(max);
    }
    if let Some(secs) = args.timeout {
        config = config.with_timeout(Duration::from_secs(secs));
    }
    if let Some(secs) = args.poll_interval {
        config = config.with_poll_interval(Duration::from_secs(secs));
    }
    if let Some(dir) = &args.agent_dir {
        config = config.with_agent_dir(dir.clone());
    }
    if let Some(entrypoint) = &args.entrypoint {
        config = config.with_entrypoint(entrypoint.clone());
    }
    if let Some(raw) = &args.agent_args {
        let parsed: Value =
            serde_json::from_str(raw).context("--agent-args is not valid JSON")?;
        config = config.with_agent_args(parsed);
    }
    if let Some(path) = &args.setup_script {
        config = config.with_setup_script(path.clone());
    }
    if let Some(user) = &args.remote_user {
        config = config.with_remote_user(user.clone());
    }
    if let Some(network) = &args.network {
        config = config.with_network_policy(network.clone());
    }
    if args.no_artifacts {
        config = config.with_collect_artifacts(false);
    }

    Ok(config)
}

fn build_docker_config(args: &RunArgs) -> anyhow::Result<DockerProviderConfig> {
    let mut config = DockerProviderConfig::from_env().context("Invalid AGENT_DOCKER_* variable")?;

    if let Some(image) = &args.image {
        config = config.with_image(image.clone());
    }
    if let Some(image) = &args.gpu_image {
        config = config.with_gpu_image(image.clone());
    }
    if let Some(command) = &args.launch_command {
        config = config.with_launch_command(command.clone());
    }

    Ok(config)
}

fn render_results(results: &BTreeMap<String, TaskOutcome>) -> anyhow::Result<String> {
    let mapping: serde_json::Map<String, Value> = results
        .iter()
        .map(|(id, outcome)| (id.clone(), outcome.to_value()))
        .collect();
    Ok(serde_json::to_string_pretty(&Value::Object(mapping))?)
}

fn write_file(path: &Path, content: &str) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    fs::write(path, content).with_context(|| format!("Failed to write {}", path.display()))
}

fn print_summary(summary: &BatchSummary, submissions: &Path) {
    println!("\n=== Run Results ===");
    println!("Total tasks:  {}", summary.total);
    println!("Succeeded:    {}", summary.succeeded);
    println!("Timed out:    {}", summary.timed_out);
    println!("Errors:       {}", summary.errored);
    println!("Success rate: {:.1}%", summary.success_rate());
    println!("Submissions:  {}", submissions.display());
}

// ============================================================================
// Submissions Command Implementation
// ============================================================================

#[derive(Debug, Serialize)]
struct SubmissionsOutput {
    path: String,
    total: usize,
    succeeded: usize,
    timed_out: usize,
    errored: usize,
    results: serde_json::Map<String, Value>,
}

fn run_submissions_command(args: SubmissionsArgs) -> anyhow::Result<()> {
    if !args.path.exists() {
        anyhow::bail!("Submission log does not exist: {}", args.path.display());
    }

    let outcomes = SubmissionLog::load(&args.path)
        .with_context(|| format!("Failed to read {}", args.path.display()))?;
    let summary = BatchSummary::from_outcomes(outcomes.values());

    if args.json {
        let results = outcomes
            .into_iter()
            .map(|(task_id, outcome)| (task_id, outcome.to_value()))
            .collect();
        let output = SubmissionsOutput {
            path: args.path.display().to_string(),
            total: summary.total,
            succeeded: summary.succeeded,
            timed_out: summary.timed_out,
            errored: summary.errored,
            results,
        };
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        print_summary(&summary, &args.path);
    }

    Ok(())
}
