//! Test data builders for creating tasks
//!
//! This module provides builder patterns for creating test tasks with
//! sensible defaults and easy customization.

use std::sync::Arc;
use std::time::Duration;

use scheduler_core::{IdentityId, NodeId, Priority, TaskId};
use scheduler_dispatcher::{NewTask, Recurrence, ScheduledTask, TaskBody};
use tokio::time::Instant;

use crate::mocks::CountingBody;

/// Build a task id on the given node
pub fn task_id(node: u64, seq: u64) -> TaskId {
    TaskId {
        node: NodeId(node),
        seq,
    }
}

/// Builder for creating test tasks
pub struct TaskBuilder {
    body: Arc<dyn TaskBody>,
    identity: IdentityId,
    priority: Priority,
    node: u64,
    seq: u64,
    run_at: Option<Instant>,
    recurrence: Recurrence,
}

impl TaskBuilder {
    pub fn new() -> Self {
        Self {
            body: Arc::new(CountingBody::new("test_task")),
            identity: IdentityId::from("user-1"),
            priority: Priority::Normal,
            node: 1,
            seq: 1,
            run_at: None,
            recurrence: Recurrence::OneShot,
        }
    }

    pub fn with_body(mut self, body: Arc<dyn TaskBody>) -> Self {
        self.body = body;
        self
    }

    pub fn with_identity(mut self, identity: &str) -> Self {
        self.identity = IdentityId::from(identity);
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_node(mut self, node: u64) -> Self {
        self.node = node;
        self
    }

    pub fn with_seq(mut self, seq: u64) -> Self {
        self.seq = seq;
        self
    }

    pub fn with_run_at(mut self, run_at: Instant) -> Self {
        self.run_at = Some(run_at);
        self
    }

    pub fn with_period(mut self, period: Duration) -> Self {
        self.recurrence = Recurrence::Periodic { period };
        self
    }

    /// Build a task ready for submission
    pub fn build(self) -> NewTask {
        NewTask::new(self.body, self.identity).with_priority(self.priority)
    }

    /// Build a task as it sits in a scheduler queue
    pub fn build_scheduled(self) -> ScheduledTask {
        let id = task_id(self.node, self.seq);
        let run_at = self.run_at.unwrap_or_else(Instant::now);
        let recurrence = self.recurrence;
        ScheduledTask::new(id, self.build(), recurrence, run_at)
    }
}

impl Default for TaskBuilder {
    fn default() -> Self {
        Self::new()
    }
}
