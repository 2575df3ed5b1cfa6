//! Task definitions for the dispatch core.
//!
//! This module defines the data types that flow through a dispatch:
//!
//! - `TaskType`: closed set of task kinds known to the routing table
//! - `TaskDescriptor`: what to run and where to send it
//! - `TaskHandle`: one dispatch attempt of a logical task
//! - `TaskMessage`: the serialized form handed to the broker
//! - `TaskResult`: structured result reported by a worker
//! - `TaskOutcome`: terminal outcome of a logical task

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kinds of task the system knows how to route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    /// Greeting task served by `queue_a` workers.
    TaskA,
    /// Greeting task served by `queue_b` workers.
    TaskB,
}

impl TaskType {
    /// Every task type, in declaration order.
    pub const ALL: [TaskType; 2] = [TaskType::TaskA, TaskType::TaskB];

    /// Wire name of the task type.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::TaskA => "task_a",
            TaskType::TaskB => "task_b",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "task_a" | "a" => Ok(TaskType::TaskA),
            "task_b" | "b" => Ok(TaskType::TaskB),
            other => Err(format!(
                "unknown task type '{}': expected one of task_a, task_b",
                other
            )),
        }
    }
}

/// Description of a logical task: its type, target queue and arguments.
///
/// The queue is fixed at construction. Retries of the same logical task share
/// the descriptor and its `logical_id`.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskDescriptor {
    logical_id: Uuid,
    task_type: TaskType,
    queue: String,
    payload: serde_json::Value,
}

impl TaskDescriptor {
    /// Creates a descriptor with an empty payload.
    pub fn new(task_type: TaskType, queue: impl Into<String>) -> Self {
        Self {
            logical_id: Uuid::new_v4(),
            task_type,
            queue: queue.into(),
            payload: serde_json::Value::Null,
        }
    }

    /// Sets the task arguments.
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    /// Identifier shared by every attempt of this logical task.
    pub fn logical_id(&self) -> Uuid {
        self.logical_id
    }

    pub fn task_type(&self) -> TaskType {
        self.task_type
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }

    /// Builds the broker message for the given attempt.
    pub fn to_message(&self, attempt: u32) -> TaskMessage {
        TaskMessage {
            logical_id: self.logical_id,
            task_type: self.task_type,
            queue: self.queue.clone(),
            payload: self.payload.clone(),
            attempt,
            sent_at: Utc::now(),
        }
    }
}

/// Reference to one dispatch attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskHandle {
    /// Broker-assigned identifier of this attempt.
    pub id: String,
    /// Logical task this attempt belongs to.
    pub logical_id: Uuid,
    /// Queue the attempt was sent to.
    pub queue: String,
    /// When the broker accepted the attempt.
    pub submitted_at: DateTime<Utc>,
    /// Zero-based attempt counter.
    pub attempt: u32,
}

impl TaskHandle {
    /// Number of submissions made so far for the logical task.
    pub fn submissions(&self) -> u32 {
        self.attempt + 1
    }
}

/// Message body handed to the broker for delivery to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskMessage {
    pub logical_id: Uuid,
    pub task_type: TaskType,
    pub queue: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub attempt: u32,
    pub sent_at: DateTime<Utc>,
}

impl TaskMessage {
    /// Serializes the message as JSON bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Parses a message from JSON bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Result reported by a worker after executing a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    /// Human-readable message produced by the task.
    pub message: String,
    /// Identifier of the worker that executed the task.
    pub worker_id: String,
    /// Queue the worker consumed the task from.
    pub queue: String,
    /// Execution time measured by the worker, in milliseconds.
    pub execution_ms: u64,
    /// When the worker finished the task.
    pub completed_at: DateTime<Utc>,
    /// Broker identifier of the attempt, when the worker knows it.
    #[serde(default)]
    pub task_id: Option<String>,
}

impl TaskResult {
    pub fn new(
        message: impl Into<String>,
        worker_id: impl Into<String>,
        queue: impl Into<String>,
        execution_time: Duration,
    ) -> Self {
        Self {
            message: message.into(),
            worker_id: worker_id.into(),
            queue: queue.into(),
            execution_ms: execution_time.as_millis() as u64,
            completed_at: Utc::now(),
            task_id: None,
        }
    }

    /// Sets the broker identifier of the attempt.
    pub fn with_task_id(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn execution_time(&self) -> Duration {
        Duration::from_millis(self.execution_ms)
    }
}

/// Classification of a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Target queue missing from the routing table.
    Routing,
    /// Broker unreachable or refused the operation.
    Transport,
    /// Worker reported a failure it considers retryable.
    Worker,
    /// Worker reported a failure that must not be retried.
    TaskLogic,
    /// Worker result could not be decoded.
    MalformedResult,
    /// The execution unit tracking the task panicked.
    Panicked,
}

impl FailureKind {
    /// Returns whether a failure of this kind may succeed on a new attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, FailureKind::Transport | FailureKind::Worker)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Routing => "routing",
            FailureKind::Transport => "transport",
            FailureKind::Worker => "worker",
            FailureKind::TaskLogic => "task_logic",
            FailureKind::MalformedResult => "malformed_result",
            FailureKind::Panicked => "panicked",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal outcome of a logical task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TaskOutcome {
    Success {
        result: TaskResult,
        #[serde(rename = "execution_ms", with = "duration_millis")]
        execution_time: Duration,
        attempts: u32,
    },
    Failure {
        kind: FailureKind,
        message: String,
        attempts: u32,
    },
    TimedOut {
        attempts: u32,
        #[serde(rename = "elapsed_ms", with = "duration_millis")]
        elapsed: Duration,
    },
}

impl TaskOutcome {
    /// Builds a success outcome from a worker result.
    pub fn success(result: TaskResult, attempts: u32) -> Self {
        let execution_time = result.execution_time();
        TaskOutcome::Success {
            result,
            execution_time,
            attempts,
        }
    }

    pub fn failure(kind: FailureKind, message: impl Into<String>, attempts: u32) -> Self {
        TaskOutcome::Failure {
            kind,
            message: message.into(),
            attempts,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, TaskOutcome::Success { .. })
    }

    /// Number of submissions made for the logical task.
    pub fn attempts(&self) -> u32 {
        match self {
            TaskOutcome::Success { attempts, .. }
            | TaskOutcome::Failure { attempts, .. }
            | TaskOutcome::TimedOut { attempts, .. } => *attempts,
        }
    }

    /// Worker-measured execution time, for successful outcomes only.
    pub fn execution_time(&self) -> Option<Duration> {
        match self {
            TaskOutcome::Success { execution_time, .. } => Some(*execution_time),
            _ => None,
        }
    }

    /// Terminal status of this outcome.
    pub fn status(&self) -> TaskStatus {
        match self {
            TaskOutcome::Success { .. } => TaskStatus::Success,
            TaskOutcome::Failure { .. } => TaskStatus::Failure,
            TaskOutcome::TimedOut { .. } => TaskStatus::TimedOut,
        }
    }
}

/// Lifecycle state of a logical task.
///
/// `Sent -> Pending -> {Success | Failure -> Retrying -> Pending | TimedOut}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Sent,
    Pending,
    Retrying,
    Success,
    Failure,
    TimedOut,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Success | TaskStatus::Failure | TaskStatus::TimedOut
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskStatus::Sent => write!(f, "SENT"),
            TaskStatus::Pending => write!(f, "PENDING"),
            TaskStatus::Retrying => write!(f, "RETRY"),
            TaskStatus::Success => write!(f, "SUCCESS"),
            TaskStatus::Failure => write!(f, "FAILURE"),
            TaskStatus::TimedOut => write!(f, "TIMEOUT"),
        }
    }
}

/// Serializes a `Duration` as whole milliseconds.
pub(crate) mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Serializes an optional `Duration` as whole milliseconds.
pub(crate) mod option_duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(deserializer).map(|ms| ms.map(Duration::from_millis))
    }
}
