//! High-level recording interface over the raw Prometheus metrics.
//!
//! Every method is a no-op until [`init_metrics`](super::init_metrics) has
//! run, so library code can record unconditionally.

use std::time::Duration;

use crate::dispatch::TaskStatus;

use super::prometheus::{
    EXECUTION_SECONDS, IN_FLIGHT, OUTCOMES_TOTAL, QUEUE_DEPTH, RETRIES_TOTAL, SUBMISSIONS_TOTAL,
};

/// Metrics collector for dispatch operations.
///
/// ```ignore
/// use task_dispatch::metrics::{init_metrics, MetricsCollector};
///
/// init_metrics().expect("Failed to init metrics");
/// let collector = MetricsCollector::new();
/// collector.record_submission("queue_a", "task_a");
/// ```
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    /// Record one message sent to the broker.
    pub fn record_submission(&self, queue: &str, task_type: &str) {
        if let Some(submissions) = SUBMISSIONS_TOTAL.get() {
            submissions.with_label_values(&[queue, task_type]).inc();
        }

        tracing::trace!(queue = queue, task_type = task_type, "Recorded submission metric");
    }

    /// Record a resubmission after a transient failure.
    pub fn record_retry(&self, queue: &str) {
        if let Some(retries) = RETRIES_TOTAL.get() {
            retries.with_label_values(&[queue]).inc();
        }

        tracing::trace!(queue = queue, "Recorded retry metric");
    }

    /// Record the terminal outcome of a logical task.
    ///
    /// `execution_time` is observed only when present, i.e. for successes.
    pub fn record_outcome(
        &self,
        queue: &str,
        status: TaskStatus,
        execution_time: Option<Duration>,
    ) {
        let label = status_label(status);

        if let Some(outcomes) = OUTCOMES_TOTAL.get() {
            outcomes.with_label_values(&[queue, label]).inc();
        }

        if let (Some(histogram), Some(elapsed)) = (EXECUTION_SECONDS.get(), execution_time) {
            histogram
                .with_label_values(&[queue])
                .observe(elapsed.as_secs_f64());
        }

        tracing::trace!(queue = queue, status = label, "Recorded outcome metric");
    }

    /// Update the pending-message count for `queue`.
    pub fn set_queue_depth(&self, queue: &str, depth: usize) {
        if let Some(queue_depth) = QUEUE_DEPTH.get() {
            queue_depth.with_label_values(&[queue]).set(depth as f64);
        }

        tracing::trace!(queue = queue, depth = depth, "Updated queue depth metric");
    }

    /// Count a logical task as in flight until the returned guard drops.
    pub fn track_in_flight(&self) -> InFlightGuard {
        if let Some(in_flight) = IN_FLIGHT.get() {
            in_flight.inc();
        }
        InFlightGuard { _private: () }
    }
}

/// Decrements the in-flight gauge on drop.
#[derive(Debug)]
#[must_use = "the task stops counting as in flight when the guard is dropped"]
pub struct InFlightGuard {
    _private: (),
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if let Some(in_flight) = IN_FLIGHT.get() {
            in_flight.dec();
        }
    }
}

fn status_label(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Sent => "sent",
        TaskStatus::Pending => "pending",
        TaskStatus::Retrying => "retrying",
        TaskStatus::Success => "success",
        TaskStatus::Failure => "failure",
        TaskStatus::TimedOut => "timed_out",
    }
}
