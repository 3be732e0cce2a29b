use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use scheduler_core::{IdentityId, Priority, TaskFailure, TaskId};
use scheduler_transaction::Transaction;
use tokio::time::Instant;

/// 任务体：在事务中执行的业务逻辑
///
/// 返回的 `TaskFailure` 携带可选的重试信号，由重试策略决定任务去留。
#[async_trait]
pub trait TaskBody: Send + Sync {
    /// 用于日志、指标和竞争报告的任务类型
    fn task_type(&self) -> &str;

    async fn run(&self, txn: &mut Transaction) -> Result<(), TaskFailure>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recurrence {
    OneShot,
    Periodic { period: Duration },
}

impl Recurrence {
    pub fn is_recurring(&self) -> bool {
        matches!(self, Recurrence::Periodic { .. })
    }

    /// 周期任务的下一次运行时间
    ///
    /// 取 `scheduled + k * period` 中严格晚于 `now` 的最早一个，
    /// 错过的周期只补一次，不会积压。
    pub fn next_after(&self, scheduled: Instant, now: Instant) -> Option<Instant> {
        let Recurrence::Periodic { period } = *self else {
            return None;
        };
        if period.is_zero() {
            return None;
        }

        let elapsed = now.saturating_duration_since(scheduled);
        let periods = elapsed.as_nanos() / period.as_nanos() + 1;
        let next = u32::try_from(periods)
            .ok()
            .and_then(|periods| period.checked_mul(periods))
            .map(|offset| scheduled + offset)
            .unwrap_or(now + period);
        Some(next)
    }
}

/// 提交给调度器的新任务
#[derive(Clone)]
pub struct NewTask {
    pub body: Arc<dyn TaskBody>,
    pub identity: IdentityId,
    pub priority: Priority,
}

impl NewTask {
    pub fn new(body: Arc<dyn TaskBody>, identity: impl Into<IdentityId>) -> Self {
        Self {
            body,
            identity: identity.into(),
            priority: Priority::default(),
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

impl fmt::Debug for NewTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NewTask")
            .field("task_type", &self.body.task_type())
            .field("identity", &self.identity)
            .field("priority", &self.priority)
            .finish()
    }
}

/// 调度器持有的任务及其运行状态
///
/// 任一时刻只属于一个调度器的队列；迁移时连同运行状态一起交给新节点。
pub struct ScheduledTask {
    id: TaskId,
    body: Arc<dyn TaskBody>,
    identity: IdentityId,
    priority: Priority,
    recurrence: Recurrence,
    try_count: u32,
    last_failure: Option<TaskFailure>,
    next_run_at: Instant,
    requested_start: Option<u64>,
    cancelled: Arc<AtomicBool>,
}

impl ScheduledTask {
    pub fn new(id: TaskId, task: NewTask, recurrence: Recurrence, next_run_at: Instant) -> Self {
        Self {
            id,
            body: task.body,
            identity: task.identity,
            priority: task.priority,
            recurrence,
            try_count: 0,
            last_failure: None,
            next_run_at,
            requested_start: None,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn body(&self) -> &Arc<dyn TaskBody> {
        &self.body
    }

    pub fn task_type(&self) -> &str {
        self.body.task_type()
    }

    pub fn identity(&self) -> &IdentityId {
        &self.identity
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn recurrence(&self) -> Recurrence {
        self.recurrence
    }

    pub fn is_recurring(&self) -> bool {
        self.recurrence.is_recurring()
    }

    pub fn try_count(&self) -> u32 {
        self.try_count
    }

    pub fn last_failure(&self) -> Option<&TaskFailure> {
        self.last_failure.as_ref()
    }

    pub fn next_run_at(&self) -> Instant {
        self.next_run_at
    }

    pub fn requested_start(&self) -> Option<u64> {
        self.requested_start
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// 记录一次失败运行
    pub fn record_failure(&mut self, failure: TaskFailure) {
        self.try_count += 1;
        self.last_failure = Some(failure);
    }

    pub(crate) fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }

    pub(crate) fn set_next_run_at(&mut self, next_run_at: Instant) {
        self.next_run_at = next_run_at;
    }

    pub(crate) fn set_requested_start(&mut self, requested_start: u64) {
        self.requested_start.get_or_insert(requested_start);
    }

    /// 周期任务成功后开始新的一轮
    pub(crate) fn rearm(&mut self, next_run_at: Instant) {
        self.next_run_at = next_run_at;
        self.try_count = 0;
        self.last_failure = None;
        self.requested_start = None;
    }
}

impl fmt::Debug for ScheduledTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduledTask")
            .field("id", &self.id)
            .field("task_type", &self.task_type())
            .field("identity", &self.identity)
            .field("priority", &self.priority)
            .field("recurrence", &self.recurrence)
            .field("try_count", &self.try_count)
            .field("last_failure", &self.last_failure)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_next_after_on_time() {
        let recurrence = Recurrence::Periodic {
            period: Duration::from_millis(500),
        };
        let scheduled = Instant::now();
        let next = recurrence.next_after(scheduled, scheduled + Duration::from_millis(10));
        assert_eq!(next, Some(scheduled + Duration::from_millis(500)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_next_after_skips_missed_periods() {
        let recurrence = Recurrence::Periodic {
            period: Duration::from_millis(500),
        };
        let scheduled = Instant::now();

        // 晚了3秒：下一次在 3.5s，而不是补跑错过的六次
        let next = recurrence
            .next_after(scheduled, scheduled + Duration::from_secs(3))
            .unwrap();
        assert_eq!(next, scheduled + Duration::from_millis(3500));

        let next = recurrence
            .next_after(scheduled, scheduled + Duration::from_millis(3200))
            .unwrap();
        assert_eq!(next, scheduled + Duration::from_millis(3500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_shot_never_rearms() {
        let now = Instant::now();
        assert_eq!(Recurrence::OneShot.next_after(now, now), None);
        assert!(!Recurrence::OneShot.is_recurring());
    }
}
