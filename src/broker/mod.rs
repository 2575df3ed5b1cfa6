//! Broker abstraction used by the dispatch core.
//!
//! The dispatch core never talks to a message queue directly. It goes through
//! the [`Broker`] trait, which only needs two operations:
//!
//! - `submit(queue, payload) -> id`: enqueue one message on one queue
//! - `poll(id, timeout) -> PollResponse`: wait up to `timeout` for the
//!   attempt to reach a terminal state
//!
//! Implementations must be safe for concurrent submission and polling from
//! many tasks without external locking.
//!
//! Two implementations ship with the crate:
//!
//! - [`InMemoryBroker`]: in-process queues served by simulated workers
//! - [`RedisBroker`]: Redis lists, one per queue, with per-attempt result keys
//!
//! [`ScaleQuery`] is the read-only view of queue depth and worker counts used
//! for reporting.

pub mod memory;
pub mod redis;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::BrokerError;

pub use self::memory::{GreetingExecutor, InMemoryBroker, TaskExecutor};
pub use self::redis::{RedisBroker, ResultRecord, ResultStatus};

/// State of a submitted attempt as reported by the broker.
#[derive(Debug, Clone, PartialEq)]
pub enum PollResponse {
    /// No terminal signal yet.
    Pending,
    /// A worker finished the attempt; carries the encoded result.
    Completed(Vec<u8>),
    /// A worker reported an error.
    Failed(ErrorInfo),
}

impl PollResponse {
    pub fn is_done(&self) -> bool {
        !matches!(self, PollResponse::Pending)
    }
}

/// Error details reported by a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub message: String,
    /// Whether the worker considers the failure retryable.
    #[serde(default = "default_retryable")]
    pub retryable: bool,
    #[serde(default)]
    pub worker_id: Option<String>,
}

fn default_retryable() -> bool {
    true
}

impl ErrorInfo {
    /// A retryable error.
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
            worker_id: None,
        }
    }

    /// An error that must not be retried.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
            worker_id: None,
        }
    }

    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = Some(worker_id.into());
        self
    }
}

/// Transport for task messages.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Enqueues `payload` on `queue` and returns the attempt identifier.
    async fn submit(&self, queue: &str, payload: Vec<u8>) -> Result<String, BrokerError>;

    /// Waits up to `timeout` for attempt `id` to reach a terminal state.
    ///
    /// Returns `PollResponse::Pending` when the timeout elapses first.
    async fn poll(&self, id: &str, timeout: Duration) -> Result<PollResponse, BrokerError>;
}

/// Read-only view of worker capacity, for informational reporting.
#[async_trait]
pub trait ScaleQuery: Send + Sync {
    /// Number of workers currently subscribed to `queue`.
    async fn current_worker_count(&self, queue: &str) -> Result<usize, BrokerError>;

    /// Number of messages waiting on `queue`.
    async fn queue_depth(&self, queue: &str) -> Result<usize, BrokerError>;
}
