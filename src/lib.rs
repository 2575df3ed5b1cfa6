//! task-dispatch: concurrent task dispatch and result aggregation.
//!
//! Tasks are routed by type to named queues on a message broker, waited on
//! under a ceiling timeout with bounded exponential-backoff retries, and
//! aggregated into a per-batch report.

pub mod broker;
pub mod cli;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod metrics;

pub use broker::{Broker, InMemoryBroker, RedisBroker, ScaleQuery};
pub use config::DispatchConfig;
pub use dispatch::{
    BatchCoordinator, BatchReport, DispatchClient, FailureKind, ResultWaiter, RetryPolicy,
    RoutingTable, TaskDescriptor, TaskOutcome, TaskType,
};
pub use error::{BrokerError, ConfigError, DispatchError};
