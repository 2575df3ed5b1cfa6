//! In-process broker with simulated worker subscribers.
//!
//! Each queue holds a list of subscribers. A subscriber wraps a
//! [`TaskExecutor`] and processes one message at a time (prefetch of one), so
//! adding workers to a queue increases its throughput the same way adding
//! worker processes would. Messages sent to a queue without subscribers stay
//! pending until the caller gives up.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{watch, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::dispatch::routing::RoutingTable;
use crate::dispatch::task::{TaskMessage, TaskResult, TaskType};
use crate::error::BrokerError;

use super::{Broker, ErrorInfo, PollResponse, ScaleQuery};

/// Simulated work time for `task_a`.
const TASK_A_WORK_TIME: Duration = Duration::from_millis(500);

/// Simulated work time for `task_b`.
const TASK_B_WORK_TIME: Duration = Duration::from_millis(700);

/// Executes task messages on behalf of a simulated worker.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Runs the task encoded in `payload` and returns the encoded result.
    async fn execute(&self, task_id: &str, payload: &[u8]) -> Result<Vec<u8>, ErrorInfo>;
}

struct Subscriber {
    worker_id: String,
    executor: Arc<dyn TaskExecutor>,
    slot: Arc<Semaphore>,
}

#[derive(Default)]
struct QueueState {
    subscribers: Vec<Arc<Subscriber>>,
    next: AtomicUsize,
    waiting: Arc<AtomicUsize>,
}

type ResultSlot = Arc<watch::Sender<Option<PollResponse>>>;

/// Broker whose queues and workers live inside the current process.
pub struct InMemoryBroker {
    queues: RwLock<HashMap<String, Arc<QueueState>>>,
    results: Mutex<HashMap<String, ResultSlot>>,
    available: AtomicBool,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            queues: RwLock::new(HashMap::new()),
            results: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }

    /// Creates a broker with `workers_per_queue` greeting workers on every
    /// routed queue.
    pub fn with_greeting_workers(routing: &RoutingTable, workers_per_queue: usize) -> Self {
        let broker = Self::new();
        for queue in routing.queues() {
            for n in 1..=workers_per_queue {
                let worker_id = format!("{}-worker-{}", queue, n);
                let executor = GreetingExecutor::new(&worker_id);
                broker.subscribe(queue, worker_id, Arc::new(executor));
            }
        }
        broker
    }

    /// Adds a worker to `queue`. Builder form of [`subscribe`](Self::subscribe).
    pub fn with_worker(
        self,
        queue: &str,
        worker_id: impl Into<String>,
        executor: Arc<dyn TaskExecutor>,
    ) -> Self {
        self.subscribe(queue, worker_id, executor);
        self
    }

    /// Adds a worker to `queue`.
    pub fn subscribe(
        &self,
        queue: &str,
        worker_id: impl Into<String>,
        executor: Arc<dyn TaskExecutor>,
    ) {
        let subscriber = Arc::new(Subscriber {
            worker_id: worker_id.into(),
            executor,
            slot: Arc::new(Semaphore::new(1)),
        });

        let mut queues = self.queues.write().unwrap_or_else(|e| e.into_inner());
        let state = queues.entry(queue.to_string()).or_default();
        // Subscribers are only appended, so rebuilding keeps existing counters.
        let mut subscribers = state.subscribers.clone();
        subscribers.push(subscriber);
        let rebuilt = QueueState {
            subscribers,
            next: AtomicUsize::new(state.next.load(Ordering::SeqCst)),
            waiting: Arc::clone(&state.waiting),
        };
        *state = Arc::new(rebuilt);
    }

    /// Simulates the broker going down (`false`) or coming back (`true`).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of submitted attempts whose terminal answer has not been read.
    pub fn tracked_results(&self) -> usize {
        self.results.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn queue_state(&self, queue: &str) -> Option<Arc<QueueState>> {
        let queues = self.queues.read().unwrap_or_else(|e| e.into_inner());
        queues.get(queue).cloned()
    }

    fn result_slot(&self, id: &str) -> Option<ResultSlot> {
        let results = self.results.lock().unwrap_or_else(|e| e.into_inner());
        results.get(id).cloned()
    }

    fn deliver(&self, id: String, queue: &str, payload: Vec<u8>, slot: ResultSlot) {
        let state = match self.queue_state(queue) {
            Some(state) if !state.subscribers.is_empty() => state,
            _ => {
                debug!(task_id = %id, queue = queue, "No subscribers, message stays queued");
                let mut queues = self.queues.write().unwrap_or_else(|e| e.into_inner());
                let state = queues.entry(queue.to_string()).or_default();
                state.waiting.fetch_add(1, Ordering::SeqCst);
                return;
            }
        };

        let index = state.next.fetch_add(1, Ordering::SeqCst) % state.subscribers.len();
        let subscriber = Arc::clone(&state.subscribers[index]);
        let waiting = Arc::clone(&state.waiting);
        waiting.fetch_add(1, Ordering::SeqCst);

        tokio::spawn(async move {
            let permit = subscriber.slot.acquire().await;
            waiting.fetch_sub(1, Ordering::SeqCst);
            let Ok(_permit) = permit else {
                return;
            };

            debug!(
                task_id = %id,
                worker_id = %subscriber.worker_id,
                "Worker picked up message"
            );

            let response = match subscriber.executor.execute(&id, &payload).await {
                Ok(body) => PollResponse::Completed(body),
                Err(info) => {
                    let info = match info.worker_id {
                        Some(_) => info,
                        None => info.with_worker_id(subscriber.worker_id.clone()),
                    };
                    PollResponse::Failed(info)
                }
            };
            slot.send_replace(Some(response));
        });
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn submit(&self, queue: &str, payload: Vec<u8>) -> Result<String, BrokerError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(BrokerError::Unavailable("connection refused".to_string()));
        }

        let id = Uuid::new_v4().to_string();
        let (tx, _rx) = watch::channel(None);
        let slot = Arc::new(tx);
        {
            let mut results = self.results.lock().unwrap_or_else(|e| e.into_inner());
            results.insert(id.clone(), Arc::clone(&slot));
        }

        self.deliver(id.clone(), queue, payload, slot);
        Ok(id)
    }

    async fn poll(&self, id: &str, timeout: Duration) -> Result<PollResponse, BrokerError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(BrokerError::Unavailable("connection refused".to_string()));
        }

        let slot = self
            .result_slot(id)
            .ok_or_else(|| BrokerError::Unavailable(format!("unknown task id {}", id)))?;
        let mut rx = slot.subscribe();

        let terminal = match tokio::time::timeout(timeout, rx.wait_for(Option::is_some)).await {
            Ok(Ok(value)) => value.clone(),
            Ok(Err(_)) | Err(_) => None,
        };

        match terminal {
            Some(response) => {
                // A terminal answer is read once, like a popped Redis result.
                self.results
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(id);
                Ok(response)
            }
            None => Ok(PollResponse::Pending),
        }
    }
}

#[async_trait]
impl ScaleQuery for InMemoryBroker {
    async fn current_worker_count(&self, queue: &str) -> Result<usize, BrokerError> {
        Ok(self
            .queue_state(queue)
            .map(|state| state.subscribers.len())
            .unwrap_or(0))
    }

    async fn queue_depth(&self, queue: &str) -> Result<usize, BrokerError> {
        Ok(self
            .queue_state(queue)
            .map(|state| state.waiting.load(Ordering::SeqCst))
            .unwrap_or(0))
    }
}

/// Worker body that answers with a greeting, like the demo tasks.
///
/// `task_a` takes 500 ms and `task_b` 700 ms unless a fixed work time is set.
pub struct GreetingExecutor {
    worker_id: String,
    work_time: Option<Duration>,
}

impl GreetingExecutor {
    pub fn new(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            work_time: None,
        }
    }

    /// Overrides the simulated work time for every task type.
    pub fn with_work_time(mut self, work_time: Duration) -> Self {
        self.work_time = Some(work_time);
        self
    }

    fn work_time_for(&self, task_type: TaskType) -> Duration {
        self.work_time.unwrap_or(match task_type {
            TaskType::TaskA => TASK_A_WORK_TIME,
            TaskType::TaskB => TASK_B_WORK_TIME,
        })
    }

    fn greeting(task_type: TaskType) -> &'static str {
        match task_type {
            TaskType::TaskA => "Hello from Task A",
            TaskType::TaskB => "Hello from Task B",
        }
    }
}

#[async_trait]
impl TaskExecutor for GreetingExecutor {
    async fn execute(&self, task_id: &str, payload: &[u8]) -> Result<Vec<u8>, ErrorInfo> {
        let message = TaskMessage::from_bytes(payload).map_err(|e| {
            warn!(task_id = task_id, error = %e, "Rejecting malformed task message");
            ErrorInfo::permanent(format!("malformed task message: {}", e))
                .with_worker_id(&self.worker_id)
        })?;

        let start = Instant::now();
        info!(
            task_id = task_id,
            task_name = %message.task_type,
            worker_id = %self.worker_id,
            queue = %message.queue,
            retry_count = message.attempt,
            "Starting task execution"
        );

        tokio::time::sleep(self.work_time_for(message.task_type)).await;

        let result = TaskResult::new(
            Self::greeting(message.task_type),
            &self.worker_id,
            &message.queue,
            start.elapsed(),
        )
        .with_task_id(task_id);

        info!(
            task_id = task_id,
            execution_ms = result.execution_ms,
            "Completed task execution"
        );

        serde_json::to_vec(&result)
            .map_err(|e| ErrorInfo::transient(e.to_string()).with_worker_id(&self.worker_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::task::TaskDescriptor;

    fn encoded(task_type: TaskType, queue: &str) -> Vec<u8> {
        TaskDescriptor::new(task_type, queue)
            .to_message(0)
            .to_bytes()
            .expect("message should serialize")
    }

    struct AlwaysFails;

    #[async_trait]
    impl TaskExecutor for AlwaysFails {
        async fn execute(&self, _task_id: &str, _payload: &[u8]) -> Result<Vec<u8>, ErrorInfo> {
            Err(ErrorInfo::permanent("division by zero"))
        }
    }

    #[tokio::test]
    async fn test_greeting_worker_completes_task() {
        let broker = InMemoryBroker::new().with_worker(
            "queue_a",
            "worker-a",
            Arc::new(GreetingExecutor::new("worker-a").with_work_time(Duration::from_millis(10))),
        );

        let id = broker
            .submit("queue_a", encoded(TaskType::TaskA, "queue_a"))
            .await
            .expect("submit should succeed");
        let response = broker
            .poll(&id, Duration::from_secs(2))
            .await
            .expect("poll should succeed");

        let PollResponse::Completed(body) = response else {
            panic!("expected completion, got {:?}", response);
        };
        assert_eq!(broker.tracked_results(), 0);
        let result: TaskResult = serde_json::from_slice(&body).expect("result should parse");
        assert_eq!(result.message, "Hello from Task A");
        assert_eq!(result.worker_id, "worker-a");
        assert_eq!(result.queue, "queue_a");
        assert_eq!(result.task_id.as_deref(), Some(id.as_str()));
    }

    #[tokio::test]
    async fn test_worker_failure_is_tagged_with_worker_id() {
        let broker = InMemoryBroker::new().with_worker("queue_a", "worker-x", Arc::new(AlwaysFails));

        let id = broker
            .submit("queue_a", encoded(TaskType::TaskA, "queue_a"))
            .await
            .expect("submit should succeed");
        let response = broker.poll(&id, Duration::from_secs(1)).await.unwrap();

        match response {
            PollResponse::Failed(info) => {
                assert!(!info.retryable);
                assert_eq!(info.worker_id.as_deref(), Some("worker-x"));
            }
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_queue_without_workers_stays_pending() {
        let broker = InMemoryBroker::new();

        let id = broker
            .submit("queue_z", encoded(TaskType::TaskB, "queue_z"))
            .await
            .expect("submit should succeed");
        let response = broker.poll(&id, Duration::from_millis(50)).await.unwrap();

        assert_eq!(response, PollResponse::Pending);
        assert_eq!(broker.queue_depth("queue_z").await.unwrap(), 1);
        assert_eq!(broker.current_worker_count("queue_z").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unavailable_broker_rejects_submission() {
        let broker = InMemoryBroker::new();
        broker.set_available(false);

        let err = broker
            .submit("queue_a", encoded(TaskType::TaskA, "queue_a"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("connection refused"));
    }

    #[tokio::test]
    async fn test_terminal_answer_is_consumed_by_poll() {
        let broker = InMemoryBroker::new().with_worker("queue_a", "worker-x", Arc::new(AlwaysFails));

        let id = broker
            .submit("queue_a", encoded(TaskType::TaskA, "queue_a"))
            .await
            .expect("submit should succeed");
        assert_eq!(broker.tracked_results(), 1);

        let response = broker.poll(&id, Duration::from_secs(1)).await.unwrap();

        assert!(response.is_done());
        assert_eq!(broker.tracked_results(), 0);
        assert!(broker.poll(&id, Duration::from_millis(10)).await.is_err());
    }

    #[tokio::test]
    async fn test_unknown_id_is_an_error() {
        let broker = InMemoryBroker::new();
        assert!(broker.poll("missing", Duration::from_millis(10)).await.is_err());
    }

    #[tokio::test]
    async fn test_scale_query_counts_workers() {
        let broker = InMemoryBroker::with_greeting_workers(&RoutingTable::default(), 3);

        assert_eq!(broker.current_worker_count("queue_a").await.unwrap(), 3);
        assert_eq!(broker.current_worker_count("queue_b").await.unwrap(), 3);
        assert_eq!(broker.current_worker_count("queue_z").await.unwrap(), 0);
        assert_eq!(broker.queue_depth("queue_a").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_malformed_message_is_permanent_failure() {
        let executor = GreetingExecutor::new("worker-a");
        let err = executor.execute("t-1", b"not json").await.unwrap_err();

        assert!(!err.retryable);
        assert!(err.message.contains("malformed"));
    }
}
