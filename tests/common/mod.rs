//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use task_dispatch::broker::{Broker, ErrorInfo, PollResponse};
use task_dispatch::dispatch::TaskResult;
use task_dispatch::BrokerError;

/// What the broker answers for one submission.
#[derive(Debug, Clone)]
pub enum Step {
    /// Completes successfully after the given execution time.
    Succeed(Duration),
    /// Fails after a short delay.
    Fail(ErrorInfo),
    /// Never completes.
    Hang,
    /// Broker hands back a result record that cannot be decoded.
    Malformed,
    /// The poll itself panics.
    Panic,
    /// `submit` never returns.
    StallSubmit,
}

/// Broker that answers each submission from a per-queue script and counts
/// submissions. Once a queue's script is exhausted, submissions hang.
#[derive(Default)]
pub struct ScriptedBroker {
    scripts: Mutex<HashMap<String, VecDeque<Step>>>,
    attempts: Mutex<HashMap<String, (String, Step)>>,
    submissions: AtomicUsize,
    per_queue: Mutex<HashMap<String, usize>>,
}

impl ScriptedBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(self, queue: &str, steps: impl IntoIterator<Item = Step>) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .entry(queue.to_string())
            .or_default()
            .extend(steps);
        self
    }

    pub fn submissions(&self) -> usize {
        self.submissions.load(Ordering::SeqCst)
    }

    pub fn submissions_to(&self, queue: &str) -> usize {
        self.per_queue
            .lock()
            .unwrap()
            .get(queue)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl Broker for ScriptedBroker {
    async fn submit(&self, queue: &str, _payload: Vec<u8>) -> Result<String, BrokerError> {
        let n = self.submissions.fetch_add(1, Ordering::SeqCst);
        *self
            .per_queue
            .lock()
            .unwrap()
            .entry(queue.to_string())
            .or_default() += 1;

        let step = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(queue)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Step::Hang);

        if let Step::StallSubmit = step {
            return std::future::pending().await;
        }

        let id = format!("scripted-{}", n);
        self.attempts
            .lock()
            .unwrap()
            .insert(id.clone(), (queue.to_string(), step));
        Ok(id)
    }

    async fn poll(&self, id: &str, timeout: Duration) -> Result<PollResponse, BrokerError> {
        let attempt = self.attempts.lock().unwrap().get(id).cloned();
        let Some((queue, step)) = attempt else {
            return Err(BrokerError::Unavailable(format!("unknown task id {}", id)));
        };

        match step {
            Step::Succeed(execution) if execution <= timeout => {
                tokio::time::sleep(execution).await;
                let result = TaskResult::new("Hello from scripted worker", "scripted-worker", &queue, execution)
                    .with_task_id(id);
                Ok(PollResponse::Completed(serde_json::to_vec(&result).unwrap()))
            }
            Step::Fail(info) if Duration::from_millis(10) <= timeout => {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok(PollResponse::Failed(info.with_worker_id("scripted-worker")))
            }
            Step::Malformed if Duration::from_millis(10) <= timeout => {
                tokio::time::sleep(Duration::from_millis(10)).await;
                let err = serde_json::from_slice::<TaskResult>(b"{not json").unwrap_err();
                Err(BrokerError::Serialization(err))
            }
            Step::Panic => panic!("scripted broker failure on {}", id),
            _ => {
                tokio::time::sleep(timeout).await;
                Ok(PollResponse::Pending)
            }
        }
    }
}
