//! Task dispatch and result aggregation.
//!
//! - **DispatchClient**: routes descriptors to queues and submits them
//! - **ResultWaiter**: waits for one logical task under a ceiling timeout,
//!   resubmitting on transient failures per the [`RetryPolicy`]
//! - **BatchCoordinator**: fans a batch out concurrently and aggregates a
//!   [`BatchReport`]
//!
//! # Architecture
//!
//! ```text
//!                   ┌──────────────────┐
//!                   │ BatchCoordinator │
//!                   └────────┬─────────┘
//!                            │ one waiter per task
//!         ┌──────────────────┼──────────────────┐
//!         ▼                  ▼                  ▼
//!   ┌────────────┐     ┌────────────┐     ┌────────────┐
//!   │ResultWaiter│     │ResultWaiter│     │ResultWaiter│
//!   └─────┬──────┘     └─────┬──────┘     └─────┬──────┘
//!         └──────────────────┼──────────────────┘
//!                     ┌──────▼───────┐
//!                     │DispatchClient│
//!                     └──────┬───────┘
//!                     ┌──────▼───────┐
//!                     │    Broker    │  queue_a, queue_b, ...
//!                     └──────┬───────┘
//!                 ┌──────────┴──────────┐
//!                 ▼                     ▼
//!            ┌─────────┐           ┌─────────┐
//!            │ Workers │           │ Workers │
//!            └─────────┘           └─────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use task_dispatch::broker::InMemoryBroker;
//! use task_dispatch::config::DispatchConfig;
//! use task_dispatch::dispatch::{BatchCoordinator, TaskType};
//!
//! let config = DispatchConfig::default();
//! let broker = Arc::new(InMemoryBroker::with_greeting_workers(&config.routing, 1));
//! let coordinator = BatchCoordinator::new(broker, &config);
//!
//! let descriptors = vec![
//!     config.routing.descriptor(TaskType::TaskA)?,
//!     config.routing.descriptor(TaskType::TaskB)?,
//! ];
//! let report = coordinator.run_batch(descriptors).await;
//! println!("{} succeeded", report.summary.success_count);
//! ```

pub mod batch;
pub mod client;
pub mod retry;
pub mod routing;
pub mod task;
pub mod waiter;

pub use batch::{BatchCoordinator, BatchReport, BatchSummary, TaskReport, UnfinishedTask};
pub use client::DispatchClient;
pub use retry::RetryPolicy;
pub use routing::RoutingTable;
pub use task::{
    FailureKind, TaskDescriptor, TaskHandle, TaskMessage, TaskOutcome, TaskResult, TaskStatus,
    TaskType,
};
pub use waiter::ResultWaiter;
