//! Submission of task descriptors to the broker.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::broker::Broker;
use crate::error::DispatchError;
use crate::metrics::MetricsCollector;

use super::routing::RoutingTable;
use super::task::{TaskDescriptor, TaskHandle, TaskStatus};

/// Sends task descriptors to their queue through the broker.
///
/// The client never retries: a failed submission surfaces to the caller, and
/// retrying whole attempts is the result waiter's job.
#[derive(Clone)]
pub struct DispatchClient {
    broker: Arc<dyn Broker>,
    routing: Arc<RoutingTable>,
    metrics: MetricsCollector,
}

impl DispatchClient {
    pub fn new(broker: Arc<dyn Broker>, routing: Arc<RoutingTable>) -> Self {
        Self {
            broker,
            routing,
            metrics: MetricsCollector::new(),
        }
    }

    /// Submits the first attempt of a logical task.
    ///
    /// # Errors
    ///
    /// - `DispatchError::Routing` if the descriptor's queue is not routed
    /// - `DispatchError::Transport` if the broker refuses the message
    pub async fn submit(&self, descriptor: &TaskDescriptor) -> Result<TaskHandle, DispatchError> {
        self.submit_attempt(descriptor, 0).await
    }

    /// Submits attempt `attempt` of a logical task, producing a new handle.
    pub async fn submit_attempt(
        &self,
        descriptor: &TaskDescriptor,
        attempt: u32,
    ) -> Result<TaskHandle, DispatchError> {
        let queue = descriptor.queue();
        if !self.routing.contains_queue(queue) {
            warn!(
                logical_id = %descriptor.logical_id(),
                task_type = %descriptor.task_type(),
                queue = queue,
                "Refusing to submit to unrouted queue"
            );
            return Err(DispatchError::Routing {
                queue: queue.to_string(),
            });
        }

        let payload = descriptor.to_message(attempt).to_bytes()?;
        let id = self.broker.submit(queue, payload).await.map_err(|e| {
            debug!(queue = queue, error = %e, "Broker rejected submission");
            DispatchError::Transport(e)
        })?;

        self.metrics
            .record_submission(queue, descriptor.task_type().as_str());
        info!(
            status = %TaskStatus::Sent,
            task_id = %id,
            logical_id = %descriptor.logical_id(),
            task_type = %descriptor.task_type(),
            queue = queue,
            attempt = attempt,
            "Task dispatched"
        );

        Ok(TaskHandle {
            id,
            logical_id: descriptor.logical_id(),
            queue: queue.to_string(),
            submitted_at: Utc::now(),
            attempt,
        })
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    pub fn routing(&self) -> &RoutingTable {
        &self.routing
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;
    use crate::dispatch::task::{TaskMessage, TaskType};

    fn client_with(broker: Arc<InMemoryBroker>) -> DispatchClient {
        DispatchClient::new(broker, Arc::new(RoutingTable::default()))
    }

    #[tokio::test]
    async fn test_submit_returns_first_attempt_handle() {
        let client = client_with(Arc::new(InMemoryBroker::new()));
        let descriptor = TaskDescriptor::new(TaskType::TaskA, "queue_a");

        let handle = client.submit(&descriptor).await.expect("submit should work");

        assert_eq!(handle.attempt, 0);
        assert_eq!(handle.queue, "queue_a");
        assert_eq!(handle.logical_id, descriptor.logical_id());
        assert!(!handle.id.is_empty());
    }

    #[tokio::test]
    async fn test_resubmission_gets_new_handle() {
        let client = client_with(Arc::new(InMemoryBroker::new()));
        let descriptor = TaskDescriptor::new(TaskType::TaskB, "queue_b");

        let first = client.submit(&descriptor).await.unwrap();
        let second = client.submit_attempt(&descriptor, 1).await.unwrap();

        assert_ne!(first.id, second.id);
        assert_eq!(second.attempt, 1);
        assert_eq!(second.submissions(), 2);
        assert_eq!(first.logical_id, second.logical_id);
    }

    #[tokio::test]
    async fn test_unknown_queue_is_routing_error() {
        let client = client_with(Arc::new(InMemoryBroker::new()));
        let descriptor = TaskDescriptor::new(TaskType::TaskA, "queue_z");

        let err = client.submit(&descriptor).await.unwrap_err();
        assert!(matches!(err, DispatchError::Routing { ref queue } if queue == "queue_z"));
    }

    #[tokio::test]
    async fn test_broker_down_is_transport_error() {
        let broker = Arc::new(InMemoryBroker::new());
        broker.set_available(false);
        let client = client_with(broker);

        let err = client
            .submit(&TaskDescriptor::new(TaskType::TaskA, "queue_a"))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Transport(_)));
    }

    #[test]
    fn test_message_carries_attempt() {
        let descriptor = TaskDescriptor::new(TaskType::TaskA, "queue_a");
        let bytes = descriptor.to_message(3).to_bytes().unwrap();
        let message = TaskMessage::from_bytes(&bytes).unwrap();

        assert_eq!(message.attempt, 3);
        assert_eq!(message.queue, "queue_a");
    }
}
