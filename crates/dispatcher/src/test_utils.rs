#[cfg(test)]
pub mod mocks {
    use std::sync::Arc;

    use async_trait::async_trait;
    use scheduler_core::{NodeId, Priority, TaskFailure, TaskId};
    use scheduler_transaction::Transaction;
    use tokio::time::Instant;

    use crate::task::{NewTask, Recurrence, ScheduledTask, TaskBody};

    pub struct NoopBody;

    #[async_trait]
    impl TaskBody for NoopBody {
        fn task_type(&self) -> &str {
            "noop"
        }

        async fn run(&self, _txn: &mut Transaction) -> Result<(), TaskFailure> {
            Ok(())
        }
    }

    pub fn task_id(seq: u64) -> TaskId {
        TaskId {
            node: NodeId(1),
            seq,
        }
    }

    pub fn scheduled(seq: u64, priority: Priority) -> ScheduledTask {
        scheduled_at(seq, priority, Instant::now(), Recurrence::OneShot)
    }

    pub fn scheduled_at(
        seq: u64,
        priority: Priority,
        run_at: Instant,
        recurrence: Recurrence,
    ) -> ScheduledTask {
        let task = NewTask::new(Arc::new(NoopBody), "user-1").with_priority(priority);
        ScheduledTask::new(task_id(seq), task, recurrence, run_at)
    }
}
