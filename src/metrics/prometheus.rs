//! Prometheus metrics registration and export.
//!
//! Defines every metric the dispatcher records and the functions that
//! initialise and export them.

use prometheus::{CounterVec, Encoder, Gauge, GaugeVec, HistogramVec, Opts, Registry, TextEncoder};
use std::sync::OnceLock;

/// Global Prometheus registry for all dispatch metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Submissions sent to the broker, labeled by queue and task type.
pub static SUBMISSIONS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Terminal outcomes, labeled by queue and status.
pub static OUTCOMES_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Resubmissions after a transient failure, labeled by queue.
pub static RETRIES_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Worker-reported execution time of successful tasks, labeled by queue.
pub static EXECUTION_SECONDS: OnceLock<HistogramVec> = OnceLock::new();

/// Logical tasks currently awaiting a terminal outcome.
pub static IN_FLIGHT: OnceLock<Gauge> = OnceLock::new();

/// Pending messages per queue, as last observed.
pub static QUEUE_DEPTH: OnceLock<GaugeVec> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Call once at startup. Later calls build a fresh registry but leave the
/// already-installed statics in place.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails, typically due to
/// duplicate metric names or invalid metric configurations.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    let submissions_total = CounterVec::new(
        Opts::new(
            "task_dispatch_submissions_total",
            "Total task submissions sent to the broker",
        ),
        &["queue", "task_type"],
    )?;

    let outcomes_total = CounterVec::new(
        Opts::new(
            "task_dispatch_outcomes_total",
            "Total terminal task outcomes",
        ),
        &["queue", "status"],
    )?;

    let retries_total = CounterVec::new(
        Opts::new(
            "task_dispatch_retries_total",
            "Total resubmissions after transient failures",
        ),
        &["queue"],
    )?;

    let execution_seconds = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "task_dispatch_execution_seconds",
            "Worker-reported execution time of successful tasks",
        )
        .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        &["queue"],
    )?;

    let in_flight = Gauge::new(
        "task_dispatch_in_flight",
        "Logical tasks awaiting a terminal outcome",
    )?;

    let queue_depth = GaugeVec::new(
        Opts::new("task_dispatch_queue_depth", "Pending messages per queue"),
        &["queue"],
    )?;

    registry.register(Box::new(submissions_total.clone()))?;
    registry.register(Box::new(outcomes_total.clone()))?;
    registry.register(Box::new(retries_total.clone()))?;
    registry.register(Box::new(execution_seconds.clone()))?;
    registry.register(Box::new(in_flight.clone()))?;
    registry.register(Box::new(queue_depth.clone()))?;

    // Already-set statics mean a previous call won; keep those.
    let _ = REGISTRY.set(registry);
    let _ = SUBMISSIONS_TOTAL.set(submissions_total);
    let _ = OUTCOMES_TOTAL.set(outcomes_total);
    let _ = RETRIES_TOTAL.set(retries_total);
    let _ = EXECUTION_SECONDS.set(execution_seconds);
    let _ = IN_FLIGHT.set(in_flight);
    let _ = QUEUE_DEPTH.set(queue_depth);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// Returns a comment line instead when the registry has not been initialized
/// or encoding fails.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics() {
        let result = init_metrics();
        assert!(result.is_ok() || REGISTRY.get().is_some());
    }

    #[test]
    fn test_metrics_after_init() {
        let _ = init_metrics();

        if let Some(submissions) = SUBMISSIONS_TOTAL.get() {
            submissions.with_label_values(&["queue_a", "task_a"]).inc();
        }

        let metrics = export_metrics();
        assert!(!metrics.starts_with("# Error"));
        assert!(metrics.contains("task_dispatch_submissions_total"));
    }
}
