//! Routing of task types to queues.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::DispatchError;

use super::task::{TaskDescriptor, TaskType};

/// Read-only mapping from task type to queue name, built once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingTable {
    routes: BTreeMap<TaskType, String>,
}

impl Default for RoutingTable {
    /// `task_a -> queue_a`, `task_b -> queue_b`.
    fn default() -> Self {
        Self::new([
            (TaskType::TaskA, "queue_a".to_string()),
            (TaskType::TaskB, "queue_b".to_string()),
        ])
    }
}

impl RoutingTable {
    pub fn new(routes: impl IntoIterator<Item = (TaskType, String)>) -> Self {
        Self {
            routes: routes.into_iter().collect(),
        }
    }

    /// Resolves the queue a task type is routed to.
    pub fn resolve(&self, task_type: TaskType) -> Result<&str, DispatchError> {
        self.routes
            .get(&task_type)
            .map(String::as_str)
            .ok_or_else(|| DispatchError::UnroutedTaskType(task_type.to_string()))
    }

    /// Returns whether `queue` is the target of at least one route.
    pub fn contains_queue(&self, queue: &str) -> bool {
        self.routes.values().any(|q| q == queue)
    }

    /// Builds a descriptor for `task_type` targeting its routed queue.
    pub fn descriptor(&self, task_type: TaskType) -> Result<TaskDescriptor, DispatchError> {
        let queue = self.resolve(task_type)?;
        Ok(TaskDescriptor::new(task_type, queue))
    }

    /// Distinct queue names, sorted.
    pub fn queues(&self) -> BTreeSet<&str> {
        self.routes.values().map(String::as_str).collect()
    }

    pub fn routes(&self) -> impl Iterator<Item = (TaskType, &str)> {
        self.routes.iter().map(|(t, q)| (*t, q.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_routes() {
        let table = RoutingTable::default();

        assert_eq!(table.resolve(TaskType::TaskA).unwrap(), "queue_a");
        assert_eq!(table.resolve(TaskType::TaskB).unwrap(), "queue_b");
        assert!(table.contains_queue("queue_a"));
        assert!(!table.contains_queue("queue_z"));
        assert_eq!(table.queues().len(), 2);
    }

    #[test]
    fn test_missing_route() {
        let table = RoutingTable::new([(TaskType::TaskA, "queue_a".to_string())]);

        let err = table.resolve(TaskType::TaskB).unwrap_err();
        assert!(err.is_routing());
        assert!(table.descriptor(TaskType::TaskB).is_err());
    }

    #[test]
    fn test_descriptor_uses_routed_queue() {
        let table = RoutingTable::new([(TaskType::TaskB, "slow_lane".to_string())]);
        let descriptor = table.descriptor(TaskType::TaskB).unwrap();

        assert_eq!(descriptor.queue(), "slow_lane");
    }
}
