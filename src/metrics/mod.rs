//! Prometheus-based monitoring for task dispatch.
//!
//! # Example
//!
//! ```ignore
//! use task_dispatch::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! init_metrics().expect("Failed to initialize metrics");
//!
//! let collector = MetricsCollector::new();
//! collector.record_submission("queue_a", "task_a");
//!
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::{InFlightGuard, MetricsCollector};
pub use prometheus::{export_metrics, init_metrics};

pub use prometheus::{
    EXECUTION_SECONDS, IN_FLIGHT, OUTCOMES_TOTAL, QUEUE_DEPTH, REGISTRY, RETRIES_TOTAL,
    SUBMISSIONS_TOTAL,
};
