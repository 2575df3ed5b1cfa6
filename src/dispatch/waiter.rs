//! Waiting for task results under a ceiling timeout.
//!
//! The waiter drives one logical task from its first submission to a single
//! terminal [`TaskOutcome`]:
//!
//! ```text
//! Sent -> Pending -> Success
//!                 -> Failure --(transient, budget left)--> Retrying -> Sent
//!                 -> Failure (terminal)
//!                 -> TimedOut
//! ```
//!
//! The ceiling timeout covers the whole logical task, retries and backoff
//! included. Attempts still running when it elapses are abandoned without a
//! cancellation message, so a worker may keep executing them.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::broker::PollResponse;
use crate::error::DispatchError;
use crate::metrics::MetricsCollector;

use super::client::DispatchClient;
use super::retry::RetryPolicy;
use super::task::{FailureKind, TaskDescriptor, TaskHandle, TaskOutcome, TaskResult, TaskStatus};

/// Pause before polling again when a broker answers `Pending` early.
const REPOLL_INTERVAL: Duration = Duration::from_millis(50);

/// Deadline used when the ceiling timeout does not fit in an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

fn deadline_after(started: Instant, timeout: Duration) -> Instant {
    started
        .checked_add(timeout)
        .or_else(|| started.checked_add(FAR_FUTURE))
        .unwrap_or(started)
}

/// Failure of a single attempt, before the retry decision.
#[derive(Debug, Clone, PartialEq)]
struct AttemptFailure {
    kind: FailureKind,
    message: String,
}

impl AttemptFailure {
    fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// What happened to one attempt.
enum AttemptResult {
    Succeeded(TaskResult),
    Failed(AttemptFailure),
    CeilingReached,
}

/// Waits for results of dispatched tasks and retries transient failures.
#[derive(Clone)]
pub struct ResultWaiter {
    client: DispatchClient,
    policy: RetryPolicy,
    metrics: MetricsCollector,
}

impl ResultWaiter {
    pub fn new(client: DispatchClient, policy: RetryPolicy) -> Self {
        Self {
            client,
            policy,
            metrics: MetricsCollector::new(),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Submits `descriptor` and waits for its terminal outcome.
    ///
    /// Submission failures are folded into the outcome: an unrouted queue is a
    /// terminal `Routing` failure, a refused submission is a `Transport`
    /// failure subject to the retry policy. A submission the broker has not
    /// accepted by the ceiling ends the task as `TimedOut`.
    pub async fn run(&self, descriptor: &TaskDescriptor, timeout: Duration) -> TaskOutcome {
        self.run_counted(descriptor, timeout, &AtomicU32::new(0))
            .await
    }

    /// Like [`run`](Self::run), keeping `submitted` updated with the number of
    /// attempts handed to the broker so far.
    ///
    /// The counter stays readable if the returned future is dropped or
    /// unwinds before producing an outcome.
    pub async fn run_counted(
        &self,
        descriptor: &TaskDescriptor,
        timeout: Duration,
        submitted: &AtomicU32,
    ) -> TaskOutcome {
        let started = Instant::now();
        let deadline = deadline_after(started, timeout);
        match tokio::time::timeout_at(deadline, self.client.submit(descriptor)).await {
            Ok(first) => {
                self.drive(descriptor, first, started, deadline, submitted)
                    .await
            }
            Err(_) => {
                submitted.store(1, Ordering::SeqCst);
                self.submission_stalled(descriptor, 0, started)
            }
        }
    }

    /// Waits for an already submitted attempt, retrying as the policy allows.
    pub async fn wait(
        &self,
        descriptor: &TaskDescriptor,
        handle: TaskHandle,
        timeout: Duration,
    ) -> TaskOutcome {
        let started = Instant::now();
        let deadline = deadline_after(started, timeout);
        self.drive(descriptor, Ok(handle), started, deadline, &AtomicU32::new(0))
            .await
    }

    async fn drive(
        &self,
        descriptor: &TaskDescriptor,
        first: Result<TaskHandle, DispatchError>,
        started: Instant,
        deadline: Instant,
        submitted: &AtomicU32,
    ) -> TaskOutcome {
        let _in_flight = self.metrics.track_in_flight();
        let queue = descriptor.queue();
        let mut attempt = first.as_ref().map(|h| h.attempt).unwrap_or(0);
        let mut submission = first;

        loop {
            if !matches!(&submission, Err(e) if e.is_routing()) {
                submitted.store(attempt + 1, Ordering::SeqCst);
            }

            let failure = match submission {
                Ok(handle) => {
                    attempt = handle.attempt;
                    match self.await_attempt(&handle, deadline).await {
                        AttemptResult::Succeeded(result) => {
                            let outcome = TaskOutcome::success(result, attempt + 1);
                            self.finish(descriptor, &outcome);
                            return outcome;
                        }
                        AttemptResult::Failed(failure) => failure,
                        AttemptResult::CeilingReached => {
                            return self.timed_out(descriptor, attempt + 1, started);
                        }
                    }
                }
                Err(e) if e.is_routing() => {
                    let outcome = TaskOutcome::failure(FailureKind::Routing, e.to_string(), attempt);
                    self.finish(descriptor, &outcome);
                    return outcome;
                }
                Err(e) => AttemptFailure::new(FailureKind::Transport, e.to_string()),
            };

            if !self.policy.should_retry(attempt, failure.kind) {
                let outcome = TaskOutcome::failure(failure.kind, failure.message, attempt + 1);
                self.finish(descriptor, &outcome);
                return outcome;
            }

            let delay = self.policy.next_delay(attempt);
            let crosses_ceiling = Instant::now()
                .checked_add(delay)
                .map_or(true, |resume| resume >= deadline);
            if crosses_ceiling {
                warn!(
                    logical_id = %descriptor.logical_id(),
                    queue = queue,
                    attempt = attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Retry backoff would cross the ceiling timeout"
                );
                tokio::time::sleep_until(deadline).await;
                return self.timed_out(descriptor, attempt + 1, started);
            }

            warn!(
                status = %TaskStatus::Retrying,
                logical_id = %descriptor.logical_id(),
                queue = queue,
                attempt = attempt,
                kind = %failure.kind,
                error = %failure.message,
                delay_ms = delay.as_millis() as u64,
                remaining_attempts = self.policy.max_attempts.saturating_sub(attempt + 1),
                "Attempt failed, retrying after backoff"
            );
            self.metrics.record_retry(queue);

            tokio::time::sleep(delay).await;
            attempt += 1;
            let next = self.client.submit_attempt(descriptor, attempt);
            submission = match tokio::time::timeout_at(deadline, next).await {
                Ok(submission) => submission,
                Err(_) => {
                    submitted.store(attempt + 1, Ordering::SeqCst);
                    return self.submission_stalled(descriptor, attempt, started);
                }
            };
        }
    }

    fn submission_stalled(
        &self,
        descriptor: &TaskDescriptor,
        attempt: u32,
        started: Instant,
    ) -> TaskOutcome {
        warn!(
            logical_id = %descriptor.logical_id(),
            queue = descriptor.queue(),
            attempt = attempt,
            "Broker did not accept the submission before the ceiling timeout"
        );
        self.timed_out(descriptor, attempt + 1, started)
    }

    /// Polls one attempt until it reaches a terminal state or the deadline.
    async fn await_attempt(&self, handle: &TaskHandle, deadline: Instant) -> AttemptResult {
        info!(
            status = %TaskStatus::Pending,
            task_id = %handle.id,
            queue = %handle.queue,
            attempt = handle.attempt,
            "Waiting for result"
        );

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return AttemptResult::CeilingReached;
            }

            let broker = self.client.broker();
            let polled = tokio::time::timeout(remaining, broker.poll(&handle.id, remaining)).await;

            match polled {
                Err(_) => return AttemptResult::CeilingReached,
                Ok(Ok(PollResponse::Pending)) => {
                    debug!(task_id = %handle.id, "Broker returned without a terminal state");
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    tokio::time::sleep(REPOLL_INTERVAL.min(remaining)).await;
                }
                Ok(Ok(PollResponse::Completed(body))) => {
                    return match serde_json::from_slice::<TaskResult>(&body) {
                        Ok(result) => AttemptResult::Succeeded(result),
                        Err(e) => AttemptResult::Failed(AttemptFailure::new(
                            FailureKind::MalformedResult,
                            format!("undecodable result payload: {}", e),
                        )),
                    };
                }
                Ok(Ok(PollResponse::Failed(info))) => {
                    let kind = if info.retryable {
                        FailureKind::Worker
                    } else {
                        FailureKind::TaskLogic
                    };
                    let message = match &info.worker_id {
                        Some(worker) => format!("{} (worker {})", info.message, worker),
                        None => info.message,
                    };
                    return AttemptResult::Failed(AttemptFailure::new(kind, message));
                }
                Ok(Err(e)) => {
                    let kind = if e.is_malformed_record() {
                        FailureKind::MalformedResult
                    } else {
                        FailureKind::Transport
                    };
                    return AttemptResult::Failed(AttemptFailure::new(kind, e.to_string()));
                }
            }
        }
    }

    fn timed_out(&self, descriptor: &TaskDescriptor, attempts: u32, started: Instant) -> TaskOutcome {
        let outcome = TaskOutcome::TimedOut {
            attempts,
            elapsed: started.elapsed(),
        };
        self.finish(descriptor, &outcome);
        outcome
    }

    fn finish(&self, descriptor: &TaskDescriptor, outcome: &TaskOutcome) {
        let queue = descriptor.queue();
        let status = outcome.status();
        self.metrics
            .record_outcome(queue, status, outcome.execution_time());

        match outcome {
            TaskOutcome::Success {
                result,
                execution_time,
                attempts,
            } => info!(
                status = %status,
                logical_id = %descriptor.logical_id(),
                queue = queue,
                worker_id = %result.worker_id,
                attempts = attempts,
                execution_ms = execution_time.as_millis() as u64,
                "Task completed"
            ),
            TaskOutcome::Failure {
                kind,
                message,
                attempts,
            } => error!(
                status = %status,
                logical_id = %descriptor.logical_id(),
                queue = queue,
                kind = %kind,
                attempts = attempts,
                error = %message,
                "Task failed"
            ),
            TaskOutcome::TimedOut { attempts, elapsed } => warn!(
                status = %status,
                logical_id = %descriptor.logical_id(),
                queue = queue,
                attempts = attempts,
                elapsed_ms = elapsed.as_millis() as u64,
                "Ceiling timeout reached, abandoning attempt"
            ),
        }
    }
}
