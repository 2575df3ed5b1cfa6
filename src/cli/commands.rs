//! CLI command definitions for task-dispatch.
//!
//! `dispatch` fans tasks out to their queues and prints an aggregated report;
//! `status` shows queue depth and worker counts per routed queue.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::Parser;
use serde::Serialize;
use tracing::{info, warn};

use crate::broker::{Broker, InMemoryBroker, RedisBroker, ScaleQuery};
use crate::config::DispatchConfig;
use crate::dispatch::{
    BatchCoordinator, BatchReport, RoutingTable, TaskDescriptor, TaskOutcome, TaskType,
};
use crate::metrics::{export_metrics, init_metrics, MetricsCollector};

/// Separator line used in human-readable output.
const RULE: &str = "============================================================";
const THIN_RULE: &str = "------------------------------------------------------------";

/// Dispatch tasks to routed worker queues and aggregate their results.
#[derive(Parser)]
#[command(name = "task-dispatch")]
#[command(about = "Dispatch tasks to worker queues and aggregate their results")]
#[command(version)]
#[command(
    long_about = "task-dispatch sends tasks concurrently to per-type worker queues, waits for each under a ceiling timeout with bounded retries, and prints an aggregated report.\n\nExample usage:\n  task-dispatch dispatch --task task_a,task_b --count 10 --save"
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
    /// Dispatch a batch of tasks and wait for every outcome.
    #[command(alias = "run")]
    Dispatch(DispatchArgs),

    /// Show queue depth and worker count for every routed queue.
    Status(StatusArgs),
}

/// Broker and configuration selection shared by every command.
#[derive(clap::Args, Debug, Clone)]
pub struct ConnectionArgs {
    /// Redis URL; omit (or pass "memory") for the in-process broker.
    #[arg(short = 'b', long, env = "DISPATCH_BROKER_URL")]
    pub broker: Option<String>,

    /// YAML configuration file.
    #[arg(short = 'c', long)]
    pub config: Option<String>,

    /// In-process workers started per queue.
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,
}

/// Arguments for `task-dispatch dispatch`.
#[derive(Parser, Debug)]
pub struct DispatchArgs {
    /// Task types to dispatch, comma separated.
    #[arg(short = 't', long = "task", value_delimiter = ',', default_value = "task_a,task_b")]
    pub tasks: Vec<String>,

    /// Number of tasks of each type to send.
    #[arg(short = 'n', long, default_value = "1")]
    pub count: usize,

    #[command(flatten)]
    pub connection: ConnectionArgs,

    /// Ceiling timeout per task in seconds, retries included.
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Retries after the first attempt.
    #[arg(long)]
    pub max_attempts: Option<u32>,

    /// Delay before the first retry, in milliseconds.
    #[arg(long)]
    pub base_delay_ms: Option<u64>,

    /// Cap on any single retry delay, in milliseconds.
    #[arg(long)]
    pub max_delay_ms: Option<u64>,

    /// Disable randomized retry delays.
    #[arg(long)]
    pub no_jitter: bool,

    /// Output the report as JSON instead of the human-readable summary.
    #[arg(short = 'j', long)]
    pub json: bool,

    /// Save the report to dispatch_results_<timestamp>.json.
    #[arg(short = 's', long)]
    pub save: bool,

    /// Save the report to this path (implies --save).
    #[arg(short = 'o', long)]
    pub output: Option<String>,

    /// Print Prometheus metrics after the batch.
    #[arg(long)]
    pub metrics: bool,
}

/// Arguments for `task-dispatch status`.
#[derive(Parser, Debug)]
pub struct StatusArgs {
    #[command(flatten)]
    pub connection: ConnectionArgs,

    /// Output JSON instead of a table.
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
        Commands::Dispatch(args) => run_dispatch_command(args).await,
        Commands::Status(args) => run_status_command(args).await,
    }
}

// ============================================================================
// Shared setup
// ============================================================================

/// Builds the configuration: YAML file (or defaults), then environment, then
/// flags.
fn load_config(connection: &ConnectionArgs) -> anyhow::Result<DispatchConfig> {
    let mut config = match &connection.config {
        Some(path) => DispatchConfig::from_yaml_file(path)
            .with_context(|| format!("Failed to load configuration from {}", path))?,
        None => DispatchConfig::default(),
    };
    config.apply_env(|key| std::env::var(key).ok())?;

    if let Some(url) = &connection.broker {
        config.broker_url = match url.trim() {
            "" | "memory" => None,
            url => Some(url.to_string()),
        };
    }
    if let Some(workers) = connection.workers {
        config.workers_per_queue = workers;
    }
    Ok(config)
}

fn apply_dispatch_overrides(config: &mut DispatchConfig, args: &DispatchArgs) {
    if let Some(secs) = args.timeout {
        config.task_timeout = Duration::from_secs(secs);
    }
    if let Some(max_attempts) = args.max_attempts {
        config.retry.max_attempts = max_attempts;
    }
    if let Some(ms) = args.base_delay_ms {
        config.retry.base_delay = Duration::from_millis(ms);
    }
    if let Some(ms) = args.max_delay_ms {
        config.retry.max_delay = Duration::from_millis(ms);
    }
    if args.no_jitter {
        config.retry.jitter = false;
    }
}

/// Connects the configured broker, returning it both as a broker and as a
/// scale query.
async fn connect_broker(
    config: &DispatchConfig,
) -> anyhow::Result<(Arc<dyn Broker>, Arc<dyn ScaleQuery>)> {
    match &config.broker_url {
        Some(url) => {
            let broker = Arc::new(
                RedisBroker::connect(url, &config.key_prefix)
                    .await
                    .with_context(|| format!("Failed to connect to broker at {}", url))?,
            );
            let scale: Arc<dyn ScaleQuery> = broker.clone();
            let broker: Arc<dyn Broker> = broker;
            Ok((broker, scale))
        }
        None => {
            let broker = Arc::new(InMemoryBroker::with_greeting_workers(
                &config.routing,
                config.workers_per_queue,
            ));
            let scale: Arc<dyn ScaleQuery> = broker.clone();
            let broker: Arc<dyn Broker> = broker;
            Ok((broker, scale))
        }
    }
}

fn broker_label(config: &DispatchConfig) -> String {
    config
        .broker_url
        .clone()
        .unwrap_or_else(|| format!("memory ({} worker(s) per queue)", config.workers_per_queue))
}

/// Expands task type names into descriptors, interleaving types `count` times.
///
/// A type missing from the routing table still gets descriptors, addressed to
/// a queue outside the table. The client refuses those, so each one ends as a
/// `Routing` failure in the report while routed types run normally.
fn build_descriptors(
    config: &DispatchConfig,
    tasks: &[String],
    count: usize,
) -> anyhow::Result<Vec<TaskDescriptor>> {
    let fallback = RoutingTable::default();
    let mut targets = Vec::with_capacity(tasks.len());
    for name in tasks {
        let task_type = TaskType::from_str(name).map_err(|e| anyhow::anyhow!(e))?;
        let queue = match config.routing.resolve(task_type) {
            Ok(queue) => queue.to_string(),
            Err(e) => {
                warn!(task_type = %task_type, error = %e, "Task type is not routed");
                fallback
                    .resolve(task_type)
                    .ok()
                    .filter(|queue| !config.routing.contains_queue(queue))
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("unrouted:{}", task_type))
            }
        };
        targets.push((task_type, queue));
    }

    let mut descriptors = Vec::with_capacity(targets.len() * count);
    for _ in 0..count {
        for (task_type, queue) in &targets {
            descriptors.push(TaskDescriptor::new(*task_type, queue.as_str()));
        }
    }
    Ok(descriptors)
}

/// Copies the current depth of every routed queue into the metrics gauges.
async fn record_queue_depths(scale: &dyn ScaleQuery, config: &DispatchConfig) {
    let collector = MetricsCollector::new();
    for queue in config.routing.queues() {
        match scale.queue_depth(queue).await {
            Ok(depth) => collector.set_queue_depth(queue, depth),
            Err(e) => warn!(queue = queue, error = %e, "Failed to read queue depth"),
        }
    }
}

// ============================================================================
// dispatch
// ============================================================================

/// Report persisted by `--save`.
#[derive(Debug, Serialize)]
struct SavedReport<'a> {
    timestamp: DateTime<Utc>,
    broker: &'a str,
    report: &'a BatchReport,
}

async fn run_dispatch_command(args: DispatchArgs) -> anyhow::Result<()> {
    let mut config = load_config(&args.connection)?;
    apply_dispatch_overrides(&mut config, &args);
    config.validate()?;

    if args.count == 0 {
        anyhow::bail!("--count must be at least 1");
    }

    if args.metrics {
        init_metrics().context("Failed to initialize metrics")?;
    }

    let descriptors = build_descriptors(&config, &args.tasks, args.count)?;
    let label = broker_label(&config);
    let (broker, scale) = connect_broker(&config).await?;

    if !args.json {
        print_header(&label, descriptors.len(), &config);
    }

    let coordinator = BatchCoordinator::new(broker, &config).with_scale_query(Arc::clone(&scale));
    let report = coordinator
        .run_batch_until(descriptors, interrupt_signal())
        .await;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }

    if args.save || args.output.is_some() {
        let path = args
            .output
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| default_report_path(Utc::now()));
        match save_report(&report, &label, &path) {
            Ok(()) => {
                if !args.json {
                    println!("Results saved to: {}", path.display());
                }
            }
            Err(e) => warn!(path = %path.display(), error = %e, "Could not save results"),
        }
    }

    if args.metrics {
        record_queue_depths(scale.as_ref(), &config).await;
        println!("{}", export_metrics());
    }

    if report.interrupted {
        warn!(
            unfinished = report.unfinished.len(),
            "Dispatch interrupted by user"
        );
    }

    Ok(())
}

/// Resolves on Ctrl-C. Never resolves if the handler cannot be installed.
async fn interrupt_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
}

fn default_report_path(now: DateTime<Utc>) -> PathBuf {
    PathBuf::from(format!(
        "dispatch_results_{}.json",
        now.format("%Y%m%d_%H%M%S")
    ))
}

fn save_report(report: &BatchReport, broker: &str, path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let saved = SavedReport {
        timestamp: Utc::now(),
        broker,
        report,
    };
    std::fs::write(path, serde_json::to_string_pretty(&saved)?)?;
    info!(path = %path.display(), "Report saved");
    Ok(())
}

fn print_header(broker: &str, tasks: usize, config: &DispatchConfig) {
    println!("\n{}", RULE);
    println!("TASK DISPATCHER");
    println!("{}", RULE);
    println!("Timestamp: {}", Utc::now().format("%Y-%m-%d %H:%M:%S"));
    println!("Broker:    {}", broker);
    println!("Tasks:     {}", tasks);
    println!(
        "Timeout:   {}s per task, up to {} retries",
        config.task_timeout.as_secs(),
        config.retry.max_attempts
    );
    println!("{}\n", RULE);
}

fn secs(duration: Duration) -> String {
    format!("{:.3}s", duration.as_secs_f64())
}

fn print_report(report: &BatchReport) {
    let summary = &report.summary;

    println!("\n{}", RULE);
    println!("EXECUTION RESULTS");
    println!("{}", RULE);
    println!("Total Execution Time: {}", secs(summary.total_time));
    println!("Successful Tasks:     {}", summary.success_count);
    println!("Failed Tasks:         {}", summary.failure_count);
    println!("Timed Out Tasks:      {}", summary.timed_out_count);
    println!(
        "Submissions:          {} ({} retries)",
        summary.total_submissions, summary.retries
    );

    println!("\n{}", THIN_RULE);
    println!("DETAILED RESULTS");
    println!("{}", THIN_RULE);

    for entry in &report.per_task {
        match &entry.outcome {
            TaskOutcome::Success {
                result, attempts, ..
            } => {
                println!("\n[OK] {} #{}", entry.task_type, entry.index);
                println!("   Message:        {}", result.message);
                println!("   Worker:         {}", result.worker_id);
                println!("   Queue:          {}", result.queue);
                println!(
                    "   Task ID:        {}",
                    result.task_id.as_deref().unwrap_or("N/A")
                );
                println!("   Execution Time: {}", secs(result.execution_time()));
                println!("   Attempts:       {}", attempts);
                println!("   Timestamp:      {}", result.completed_at.to_rfc3339());
            }
            TaskOutcome::Failure {
                kind,
                message,
                attempts,
            } => {
                println!("\n[FAILED] {} #{}", entry.task_type, entry.index);
                println!("   Kind:     {}", kind);
                println!("   Error:    {}", message);
                println!("   Queue:    {}", entry.queue);
                println!("   Attempts: {}", attempts);
            }
            TaskOutcome::TimedOut { attempts, elapsed } => {
                println!("\n[TIMEOUT] {} #{}", entry.task_type, entry.index);
                println!("   Queue:    {}", entry.queue);
                println!("   Elapsed:  {}", secs(*elapsed));
                println!("   Attempts: {}", attempts);
            }
        }
    }

    if let (Some(avg), Some(min), Some(max)) = (
        summary.avg_execution_time,
        summary.min_execution_time,
        summary.max_execution_time,
    ) {
        println!("\n{}", THIN_RULE);
        println!("PERFORMANCE METRICS");
        println!("{}", THIN_RULE);
        println!("Average Task Time: {}", secs(avg));
        println!("Fastest Task:      {}", secs(min));
        println!("Slowest Task:      {}", secs(max));
        println!("Throughput:        {:.2} tasks/sec", summary.throughput);
    }

    if !report.worker_counts.is_empty() {
        println!("\n{}", THIN_RULE);
        println!("WORKERS");
        println!("{}", THIN_RULE);
        for (queue, count) in &report.worker_counts {
            println!("{:<20} {}", queue, count);
        }
    }

    if report.interrupted {
        println!("\nInterrupted: {} task(s) unfinished", report.unfinished.len());
        for task in &report.unfinished {
            println!("   {} #{} on {}", task.task_type, task.index, task.queue);
        }
    }

    println!("\n{}", RULE);
}

// ============================================================================
// status
// ============================================================================

#[derive(Debug, Serialize)]
struct QueueStatus {
    queue: String,
    depth: Option<usize>,
    workers: Option<usize>,
}

async fn run_status_command(args: StatusArgs) -> anyhow::Result<()> {
    let config = load_config(&args.connection)?;
    config.validate()?;
    let (_, scale) = connect_broker(&config).await?;

    let mut statuses = Vec::new();
    for queue in config.routing.queues() {
        let depth = match scale.queue_depth(queue).await {
            Ok(depth) => Some(depth),
            Err(e) => {
                warn!(queue = queue, error = %e, "Failed to read queue depth");
                None
            }
        };
        let workers = match scale.current_worker_count(queue).await {
            Ok(count) => Some(count),
            Err(e) => {
                warn!(queue = queue, error = %e, "Failed to read worker count");
                None
            }
        };
        statuses.push(QueueStatus {
            queue: queue.to_string(),
            depth,
            workers,
        });
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&statuses)?);
        return Ok(());
    }

    println!("Broker: {}", broker_label(&config));
    println!("{:<20} {:>8} {:>8}", "QUEUE", "DEPTH", "WORKERS");
    for status in &statuses {
        println!(
            "{:<20} {:>8} {:>8}",
            status.queue,
            status.depth.map_or("?".to_string(), |d| d.to_string()),
            status.workers.map_or("?".to_string(), |w| w.to_string()),
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{BatchSummary, FailureKind, TaskReport};
    use chrono::TimeZone;
    use clap::CommandFactory;
    use std::collections::BTreeMap;

    #[test]
    fn test_cli_parses() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_dispatch_command_defaults() {
        let cli = Cli::try_parse_from(["task-dispatch", "dispatch"]).expect("should parse");

        match cli.command {
            Commands::Dispatch(args) => {
                assert_eq!(args.tasks, vec!["task_a", "task_b"]);
                assert_eq!(args.count, 1);
                assert!(args.timeout.is_none());
                assert!(!args.no_jitter);
                assert!(!args.json);
                assert!(!args.save);
            }
            _ => panic!("Expected Dispatch command"),
        }
    }

    #[test]
    fn test_dispatch_command_with_all_options() {
        let cli = Cli::try_parse_from([
            "task-dispatch",
            "dispatch",
            "--task",
            "task_b",
            "-n",
            "20",
            "--broker",
            "redis://localhost:6379",
            "--timeout",
            "5",
            "--max-attempts",
            "1",
            "--base-delay-ms",
            "100",
            "--max-delay-ms",
            "400",
            "--no-jitter",
            "-w",
            "4",
            "-j",
            "-o",
            "./out/report.json",
            "--metrics",
        ])
        .expect("should parse");

        match cli.command {
            Commands::Dispatch(args) => {
                assert_eq!(args.tasks, vec!["task_b"]);
                assert_eq!(args.count, 20);
                assert_eq!(
                    args.connection.broker.as_deref(),
                    Some("redis://localhost:6379")
                );
                assert_eq!(args.connection.workers, Some(4));
                assert_eq!(args.timeout, Some(5));
                assert_eq!(args.max_attempts, Some(1));
                assert!(args.no_jitter);
                assert!(args.json);
                assert_eq!(args.output.as_deref(), Some("./out/report.json"));
                assert!(args.metrics);

                let mut config = DispatchConfig::default();
                apply_dispatch_overrides(&mut config, &args);
                assert_eq!(config.task_timeout, Duration::from_secs(5));
                assert_eq!(config.retry.base_delay, Duration::from_millis(100));
                assert_eq!(config.retry.max_delay, Duration::from_millis(400));
                assert!(!config.retry.jitter);
            }
            _ => panic!("Expected Dispatch command"),
        }
    }

    #[test]
    fn test_status_parses() {
        let cli = Cli::try_parse_from(["task-dispatch", "status", "--json"]).expect("should parse");
        assert!(matches!(cli.command, Commands::Status(ref args) if args.json));
    }

    #[test]
    fn test_build_descriptors_interleaves_types() {
        let config = DispatchConfig::default();
        let tasks = vec!["task_a".to_string(), "b".to_string()];

        let descriptors = build_descriptors(&config, &tasks, 3).unwrap();

        assert_eq!(descriptors.len(), 6);
        assert_eq!(descriptors[0].queue(), "queue_a");
        assert_eq!(descriptors[1].queue(), "queue_b");
        assert_eq!(descriptors[4].task_type(), TaskType::TaskA);
    }

    #[test]
    fn test_build_descriptors_rejects_unknown_type() {
        let config = DispatchConfig::default();
        assert!(build_descriptors(&config, &["task_q".to_string()], 1).is_err());
    }

    fn single_route_config() -> DispatchConfig {
        DispatchConfig::default()
            .with_routing(RoutingTable::new([(TaskType::TaskA, "queue_a".to_string())]))
    }

    #[test]
    fn test_build_descriptors_keeps_unrouted_types() {
        let config = single_route_config();
        let tasks = vec!["task_a".to_string(), "task_b".to_string()];

        let descriptors = build_descriptors(&config, &tasks, 2).unwrap();

        assert_eq!(descriptors.len(), 4);
        assert_eq!(descriptors[0].queue(), "queue_a");
        assert_eq!(descriptors[1].task_type(), TaskType::TaskB);
        assert!(!config.routing.contains_queue(descriptors[1].queue()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unrouted_type_does_not_block_routed_tasks() {
        let config = single_route_config();
        let tasks = vec!["task_a".to_string(), "task_b".to_string()];
        let descriptors = build_descriptors(&config, &tasks, 1).unwrap();
        let broker = Arc::new(InMemoryBroker::with_greeting_workers(&config.routing, 1));

        let report = BatchCoordinator::new(broker, &config)
            .run_batch(descriptors)
            .await;

        assert!(report.is_complete());
        assert!(report.per_task[0].outcome.is_success());
        assert!(matches!(
            report.per_task[1].outcome,
            TaskOutcome::Failure {
                kind: FailureKind::Routing,
                attempts: 0,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_record_queue_depths_sets_gauges() {
        let _ = init_metrics();
        let routing = RoutingTable::new([(TaskType::TaskA, "queue_backlog".to_string())]);
        let config = DispatchConfig::default().with_routing(routing);
        let broker = InMemoryBroker::new();
        broker
            .submit("queue_backlog", b"{}".to_vec())
            .await
            .expect("submit should succeed");

        record_queue_depths(&broker, &config).await;

        let depth = crate::metrics::QUEUE_DEPTH.get().expect("metrics initialized");
        assert_eq!(depth.with_label_values(&["queue_backlog"]).get(), 1.0);
    }

    #[test]
    fn test_default_report_path() {
        let now = Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap();
        assert_eq!(
            default_report_path(now),
            PathBuf::from("dispatch_results_20240309_140507.json")
        );
    }

    #[test]
    fn test_save_report_writes_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("report.json");

        let per_task = vec![TaskReport {
            index: 0,
            logical_id: uuid::Uuid::new_v4(),
            task_type: TaskType::TaskA,
            queue: "queue_z".to_string(),
            outcome: TaskOutcome::failure(FailureKind::Routing, "no route", 0),
        }];
        let report = BatchReport {
            started_at: Utc::now(),
            finished_at: Utc::now(),
            summary: BatchSummary::from_entries(&per_task, Duration::from_millis(3)),
            per_task,
            interrupted: false,
            unfinished: Vec::new(),
            worker_counts: BTreeMap::new(),
        };

        save_report(&report, "memory", &path).unwrap();

        let saved: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(saved["broker"], "memory");
        assert_eq!(saved["report"]["summary"]["failure_count"], 1);
        assert_eq!(saved["report"]["per_task"][0]["outcome"]["kind"], "routing");
    }
}
