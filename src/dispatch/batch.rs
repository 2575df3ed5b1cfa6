//! Concurrent fan-out of task batches and result aggregation.
//!
//! Every descriptor gets its own tokio task running a [`ResultWaiter`].
//! Results are collected in completion order through a `JoinSet` and sorted
//! back into submission order once the set is drained. A panic in one waiter
//! is caught and recorded as that task's failure, with the attempts it had
//! submitted before unwinding; siblings keep running.

use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broker::{Broker, ScaleQuery};
use crate::config::DispatchConfig;

use super::client::DispatchClient;
use super::task::{
    duration_millis, option_duration_millis, FailureKind, TaskDescriptor, TaskOutcome, TaskType,
};
use super::waiter::ResultWaiter;

/// Outcome of one logical task within a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskReport {
    /// Position of the task in the submitted batch.
    pub index: usize,
    pub logical_id: Uuid,
    pub task_type: TaskType,
    pub queue: String,
    pub outcome: TaskOutcome,
}

impl TaskReport {
    fn new(index: usize, descriptor: &TaskDescriptor, outcome: TaskOutcome) -> Self {
        Self {
            index,
            logical_id: descriptor.logical_id(),
            task_type: descriptor.task_type(),
            queue: descriptor.queue().to_string(),
            outcome,
        }
    }
}

/// A task that had not reached a terminal outcome when the batch was
/// interrupted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnfinishedTask {
    pub index: usize,
    pub logical_id: Uuid,
    pub task_type: TaskType,
    pub queue: String,
}

/// Aggregate statistics over a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub total_tasks: usize,
    pub success_count: usize,
    pub failure_count: usize,
    pub timed_out_count: usize,
    /// Wall clock from the first submission to the last terminal outcome.
    #[serde(rename = "total_time_ms", with = "duration_millis")]
    pub total_time: Duration,
    /// Mean worker execution time over successes.
    #[serde(rename = "avg_execution_ms", with = "option_duration_millis")]
    pub avg_execution_time: Option<Duration>,
    #[serde(rename = "min_execution_ms", with = "option_duration_millis")]
    pub min_execution_time: Option<Duration>,
    #[serde(rename = "max_execution_ms", with = "option_duration_millis")]
    pub max_execution_time: Option<Duration>,
    /// Completed tasks per second of wall clock.
    pub throughput: f64,
    /// Submissions across all tasks, retries included.
    pub total_submissions: u32,
    pub retries: u32,
}

impl BatchSummary {
    /// Aggregates terminal outcomes. Execution statistics cover successes only.
    pub fn from_entries(entries: &[TaskReport], total_time: Duration) -> Self {
        let mut success_count = 0;
        let mut failure_count = 0;
        let mut timed_out_count = 0;
        let mut total_submissions = 0u32;
        let mut retries = 0u32;
        let mut execution_times = Vec::new();

        for entry in entries {
            match &entry.outcome {
                TaskOutcome::Success { execution_time, .. } => {
                    success_count += 1;
                    execution_times.push(*execution_time);
                }
                TaskOutcome::Failure { .. } => failure_count += 1,
                TaskOutcome::TimedOut { .. } => timed_out_count += 1,
            }
            let attempts = entry.outcome.attempts();
            total_submissions += attempts;
            retries += attempts.saturating_sub(1);
        }

        let avg_execution_time = if execution_times.is_empty() {
            None
        } else {
            let sum: Duration = execution_times.iter().sum();
            Some(sum / execution_times.len() as u32)
        };

        let throughput = if total_time.is_zero() {
            0.0
        } else {
            entries.len() as f64 / total_time.as_secs_f64()
        };

        Self {
            total_tasks: entries.len(),
            success_count,
            failure_count,
            timed_out_count,
            total_time,
            avg_execution_time,
            min_execution_time: execution_times.iter().min().copied(),
            max_execution_time: execution_times.iter().max().copied(),
            throughput,
            total_submissions,
            retries,
        }
    }

    /// Sum of worker execution times over successes.
    pub fn cumulative_execution_time(&self) -> Option<Duration> {
        self.avg_execution_time
            .map(|avg| avg * self.success_count as u32)
    }
}

/// Result of a batch run.
///
/// `per_task` is ordered by submission. When the batch was interrupted it
/// only holds tasks that reached a terminal outcome; the rest are listed in
/// `unfinished`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub per_task: Vec<TaskReport>,
    pub summary: BatchSummary,
    pub interrupted: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unfinished: Vec<UnfinishedTask>,
    /// Worker counts per queue observed after the batch, when available.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub worker_counts: BTreeMap<String, usize>,
}

impl BatchReport {
    /// Outcome of the logical task `logical_id`, if it finished.
    pub fn outcome(&self, logical_id: Uuid) -> Option<&TaskOutcome> {
        self.per_task
            .iter()
            .find(|entry| entry.logical_id == logical_id)
            .map(|entry| &entry.outcome)
    }

    /// Returns whether every task finished, successfully or not.
    pub fn is_complete(&self) -> bool {
        !self.interrupted && self.unfinished.is_empty()
    }

    pub fn all_succeeded(&self) -> bool {
        self.is_complete() && self.per_task.iter().all(|e| e.outcome.is_success())
    }

    /// Entries whose outcome is a failure of the given kind.
    pub fn failures_of(&self, kind: FailureKind) -> impl Iterator<Item = &TaskReport> {
        self.per_task.iter().filter(move |entry| {
            matches!(&entry.outcome, TaskOutcome::Failure { kind: k, .. } if *k == kind)
        })
    }
}

/// Runs batches of tasks concurrently and aggregates their outcomes.
pub struct BatchCoordinator {
    waiter: ResultWaiter,
    task_timeout: Duration,
    scale: Option<Arc<dyn ScaleQuery>>,
}

impl BatchCoordinator {
    /// Builds a coordinator over `broker` using the routing table, retry
    /// policy and ceiling timeout from `config`.
    pub fn new(broker: Arc<dyn Broker>, config: &DispatchConfig) -> Self {
        let client = DispatchClient::new(broker, Arc::new(config.routing.clone()));
        let waiter = ResultWaiter::new(client, config.retry.clone());
        Self::from_waiter(waiter, config.task_timeout)
    }

    pub fn from_waiter(waiter: ResultWaiter, task_timeout: Duration) -> Self {
        Self {
            waiter,
            task_timeout,
            scale: None,
        }
    }

    /// Attaches a scale query whose worker counts are copied into reports.
    pub fn with_scale_query(mut self, scale: Arc<dyn ScaleQuery>) -> Self {
        self.scale = Some(scale);
        self
    }

    pub fn task_timeout(&self) -> Duration {
        self.task_timeout
    }

    /// Dispatches every descriptor concurrently and waits for all outcomes.
    pub async fn run_batch(&self, descriptors: Vec<TaskDescriptor>) -> BatchReport {
        self.run_batch_until(descriptors, std::future::pending())
            .await
    }

    /// Like [`run_batch`](Self::run_batch), but stops collecting when
    /// `interrupt` resolves.
    ///
    /// Outcomes that completed before the interrupt are kept; tasks still in
    /// flight are aborted and listed as unfinished.
    pub async fn run_batch_until<F>(
        &self,
        descriptors: Vec<TaskDescriptor>,
        interrupt: F,
    ) -> BatchReport
    where
        F: Future<Output = ()>,
    {
        let started_at = Utc::now();
        let started = Instant::now();
        let total = descriptors.len();

        info!(
            tasks = total,
            timeout_ms = self.task_timeout.as_millis() as u64,
            "Dispatching batch concurrently"
        );

        let mut set = JoinSet::new();
        for (index, descriptor) in descriptors.iter().cloned().enumerate() {
            let waiter = self.waiter.clone();
            let timeout = self.task_timeout;
            set.spawn(async move {
                let submitted = AtomicU32::new(0);
                let run = waiter.run_counted(&descriptor, timeout, &submitted);
                let outcome = AssertUnwindSafe(run)
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|panic| {
                        TaskOutcome::failure(
                            FailureKind::Panicked,
                            panic_message(&*panic),
                            submitted.load(Ordering::SeqCst),
                        )
                    });
                TaskReport::new(index, &descriptor, outcome)
            });
        }

        let mut collected: Vec<TaskReport> = Vec::with_capacity(total);
        let mut last_terminal = started;
        let mut interrupted = false;
        tokio::pin!(interrupt);

        loop {
            tokio::select! {
                biased;
                joined = set.join_next() => match joined {
                    Some(Ok(entry)) => {
                        last_terminal = Instant::now();
                        debug!(
                            index = entry.index,
                            status = %entry.outcome.status(),
                            collected = collected.len() + 1,
                            total = total,
                            "Collected task outcome"
                        );
                        collected.push(entry);
                    }
                    Some(Err(e)) => warn!(error = %e, "Waiter task ended without an outcome"),
                    None => break,
                },
                _ = &mut interrupt => {
                    warn!(
                        collected = collected.len(),
                        total = total,
                        "Batch interrupted, aborting in-flight tasks"
                    );
                    interrupted = true;
                    set.abort_all();
                    // Keep outcomes that finished before the abort landed.
                    while let Some(joined) = set.join_next().await {
                        if let Ok(entry) = joined {
                            last_terminal = Instant::now();
                            collected.push(entry);
                        }
                    }
                    break;
                }
            }
        }

        collected.sort_by_key(|entry| entry.index);
        let finished: HashSet<usize> = collected.iter().map(|e| e.index).collect();
        let unfinished = descriptors
            .iter()
            .enumerate()
            .filter(|(index, _)| !finished.contains(index))
            .map(|(index, d)| UnfinishedTask {
                index,
                logical_id: d.logical_id(),
                task_type: d.task_type(),
                queue: d.queue().to_string(),
            })
            .collect();

        let total_time = last_terminal.duration_since(started);
        let summary = BatchSummary::from_entries(&collected, total_time);
        let worker_counts = self.worker_counts(&descriptors).await;

        info!(
            tasks = summary.total_tasks,
            succeeded = summary.success_count,
            failed = summary.failure_count,
            timed_out = summary.timed_out_count,
            total_time_ms = summary.total_time.as_millis() as u64,
            throughput = summary.throughput,
            "Batch finished"
        );

        BatchReport {
            started_at,
            finished_at: Utc::now(),
            per_task: collected,
            summary,
            interrupted,
            unfinished,
            worker_counts,
        }
    }

    async fn worker_counts(&self, descriptors: &[TaskDescriptor]) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        let Some(scale) = &self.scale else {
            return counts;
        };

        for descriptor in descriptors {
            let queue = descriptor.queue();
            if counts.contains_key(queue) {
                continue;
            }
            match scale.current_worker_count(queue).await {
                Ok(count) => {
                    counts.insert(queue.to_string(), count);
                }
                Err(e) => warn!(queue = queue, error = %e, "Failed to read worker count"),
            }
        }
        counts
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("waiter panicked: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("waiter panicked: {}", s)
    } else {
        "waiter panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::task::TaskResult;

    fn entry(index: usize, outcome: TaskOutcome) -> TaskReport {
        TaskReport::new(index, &TaskDescriptor::new(TaskType::TaskA, "queue_a"), outcome)
    }

    fn success(ms: u64, attempts: u32) -> TaskOutcome {
        TaskOutcome::success(
            TaskResult::new("ok", "worker-a", "queue_a", Duration::from_millis(ms)),
            attempts,
        )
    }

    #[test]
    fn test_summary_counts_and_statistics() {
        let entries = vec![
            entry(0, success(500, 1)),
            entry(1, success(700, 2)),
            entry(2, TaskOutcome::failure(FailureKind::Worker, "boom", 4)),
            entry(
                3,
                TaskOutcome::TimedOut {
                    attempts: 1,
                    elapsed: Duration::from_secs(1),
                },
            ),
        ];

        let summary = BatchSummary::from_entries(&entries, Duration::from_secs(2));

        assert_eq!(summary.total_tasks, 4);
        assert_eq!(summary.success_count, 2);
        assert_eq!(summary.failure_count, 1);
        assert_eq!(summary.timed_out_count, 1);
        assert_eq!(summary.avg_execution_time, Some(Duration::from_millis(600)));
        assert_eq!(summary.min_execution_time, Some(Duration::from_millis(500)));
        assert_eq!(summary.max_execution_time, Some(Duration::from_millis(700)));
        assert_eq!(summary.total_submissions, 8);
        assert_eq!(summary.retries, 4);
        assert!((summary.throughput - 2.0).abs() < f64::EPSILON);
        assert_eq!(
            summary.cumulative_execution_time(),
            Some(Duration::from_millis(1200))
        );
    }

    #[test]
    fn test_summary_without_successes_has_no_statistics() {
        let entries = vec![entry(0, TaskOutcome::failure(FailureKind::Routing, "no route", 0))];

        let summary = BatchSummary::from_entries(&entries, Duration::from_millis(5));

        assert_eq!(summary.success_count, 0);
        assert!(summary.avg_execution_time.is_none());
        assert!(summary.min_execution_time.is_none());
        assert!(summary.max_execution_time.is_none());
    }

    #[test]
    fn test_empty_summary() {
        let summary = BatchSummary::from_entries(&[], Duration::ZERO);

        assert_eq!(summary.total_tasks, 0);
        assert_eq!(summary.throughput, 0.0);
    }

    #[test]
    fn test_report_serializes_durations_as_millis() {
        let entries = vec![entry(0, success(250, 1))];
        let summary = BatchSummary::from_entries(&entries, Duration::from_millis(300));
        let report = BatchReport {
            started_at: Utc::now(),
            finished_at: Utc::now(),
            per_task: entries,
            summary,
            interrupted: false,
            unfinished: Vec::new(),
            worker_counts: BTreeMap::new(),
        };

        let json = serde_json::to_value(&report).expect("report should serialize");
        assert_eq!(json["summary"]["total_time_ms"], 300);
        assert_eq!(json["summary"]["avg_execution_ms"], 250);
        assert_eq!(json["per_task"][0]["outcome"]["status"], "success");
        assert!(json.get("unfinished").is_none());
        assert!(report.all_succeeded());
    }

    #[test]
    fn test_panic_message_extraction() {
        let boxed: Box<dyn std::any::Any + Send> = Box::new("kaboom");
        assert_eq!(panic_message(&*boxed), "waiter panicked: kaboom");

        let boxed: Box<dyn std::any::Any + Send> = Box::new(42u8);
        assert_eq!(panic_message(&*boxed), "waiter panicked");
    }
}
