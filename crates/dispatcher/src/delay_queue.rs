use std::collections::BTreeMap;

use scheduler_core::TaskId;
use tokio::time::Instant;

use crate::task::ScheduledTask;

/// 按可运行时间排序的延迟任务，同一时间按入队顺序
#[derive(Default)]
pub struct DelayQueue {
    entries: BTreeMap<(Instant, u64), ScheduledTask>,
    next_seq: u64,
}

impl DelayQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn push(&mut self, task: ScheduledTask) {
        let key = (task.next_run_at(), self.next_seq);
        self.next_seq += 1;
        self.entries.insert(key, task);
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.keys().next().map(|(deadline, _)| *deadline)
    }

    /// 取出所有到期任务
    pub fn pop_due(&mut self, now: Instant) -> Vec<ScheduledTask> {
        let mut due = Vec::new();
        while let Some(entry) = self.entries.first_entry() {
            if entry.key().0 > now {
                break;
            }
            due.push(entry.remove());
        }
        due
    }

    pub fn remove(&mut self, id: TaskId) -> Option<ScheduledTask> {
        let key = self
            .entries
            .iter()
            .find(|(_, task)| task.id() == id)
            .map(|(key, _)| *key)?;
        self.entries.remove(&key)
    }

    pub fn drain(&mut self) -> Vec<ScheduledTask> {
        std::mem::take(&mut self.entries).into_values().collect()
    }
}
