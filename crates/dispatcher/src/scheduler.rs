use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use scheduler_core::{
    IdentityId, IdentityLocation, IdentityOwnership, NodeId, SchedulerConfig, SchedulerError,
    SchedulerResult, TaskFailure, TaskId,
};
use scheduler_infrastructure::{MetricsCollector, StructuredLogger};
use scheduler_transaction::{Transaction, TransactionCoordinator, TransactionState};
use scheduler_worker::ResourceCoordinator;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::delay_queue::DelayQueue;
use crate::fair_queue::FairQueue;
use crate::retry_policy::{RetryDecision, RetryPolicy};
use crate::task::{NewTask, Recurrence, ScheduledTask};

/// 把任务交给身份的新归属节点
///
/// 任务连同运行状态（重试次数、最后一次失败、事务序号）一起迁移。
#[async_trait]
pub trait TaskRelocator: Send + Sync {
    async fn relocate(&self, task: ScheduledTask, new_owner: NodeId) -> SchedulerResult<()>;
}

/// 提交任务后返回的句柄，用于在任务执行前取消
#[derive(Debug, Clone)]
pub struct TaskHandle {
    id: TaskId,
    cancelled: Arc<AtomicBool>,
    inner: Weak<SchedulerInner>,
}

impl TaskHandle {
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// 取消任务
    ///
    /// 仍在队列中的任务被移除并返回 `true`。已经在运行的事务不会被打断，
    /// 但周期任务不再重新排期，失败后也不再重试。
    pub fn cancel(&self) -> bool {
        self.cancelled.store(true, Ordering::SeqCst);
        match self.inner.upgrade() {
            Some(inner) => inner.remove_queued(self.id),
            None => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

struct QueueState {
    ready: FairQueue,
    delayed: DelayQueue,
}

impl QueueState {
    fn depth(&self) -> usize {
        self.ready.len() + self.delayed.len()
    }
}

struct SchedulerInner {
    node_id: NodeId,
    queues: Mutex<QueueState>,
    task_available: Notify,
    workers: ResourceCoordinator,
    transactions: Arc<TransactionCoordinator>,
    retry_policy: Arc<dyn RetryPolicy>,
    ownership: Arc<dyn IdentityOwnership>,
    relocator: RwLock<Option<Arc<dyn TaskRelocator>>>,
    relocation_retry_delay: Duration,
    next_seq: AtomicU64,
    shutdown: AtomicBool,
    metrics: MetricsCollector,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// 节点上的事务型任务调度器
///
/// 任务按优先级放入公平队列，延迟任务进入按到期时间排序的延迟队列。
/// 调度循环先从工作者池取得名额，再出队任务，为其开启新事务并在工作者上运行。
/// 没有任务时调度循环挂起等待通知，不会轮询。
#[derive(Clone)]
pub struct TaskScheduler {
    inner: Arc<SchedulerInner>,
}

impl TaskScheduler {
    pub fn new(
        node_id: NodeId,
        config: &SchedulerConfig,
        transactions: Arc<TransactionCoordinator>,
        ownership: Arc<dyn IdentityOwnership>,
        retry_policy: Arc<dyn RetryPolicy>,
    ) -> Self {
        let inner = SchedulerInner {
            node_id,
            queues: Mutex::new(QueueState {
                ready: FairQueue::new(&config.priority_weights),
                delayed: DelayQueue::new(),
            }),
            task_available: Notify::new(),
            workers: ResourceCoordinator::new(format!("{node_id}-workers"), config.worker_threads),
            transactions,
            retry_policy,
            ownership,
            relocator: RwLock::new(None),
            relocation_retry_delay: config.relocation_retry_delay(),
            next_seq: AtomicU64::new(1),
            shutdown: AtomicBool::new(false),
            metrics: MetricsCollector::new(),
            dispatcher: Mutex::new(None),
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn set_relocator(&self, relocator: Arc<dyn TaskRelocator>) {
        *self
            .inner
            .relocator
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(relocator);
    }

    pub fn node_id(&self) -> NodeId {
        self.inner.node_id
    }

    pub fn retry_policy(&self) -> &Arc<dyn RetryPolicy> {
        &self.inner.retry_policy
    }

    /// 提交立即可运行的任务
    pub fn schedule(&self, task: NewTask) -> SchedulerResult<TaskHandle> {
        self.submit(task, Recurrence::OneShot, Duration::ZERO)
    }

    /// 提交延迟 `delay` 后才可运行的一次性任务
    pub fn schedule_delayed(&self, task: NewTask, delay: Duration) -> SchedulerResult<TaskHandle> {
        self.submit(task, Recurrence::OneShot, delay)
    }

    /// 提交周期任务，首次运行在 `initial_delay` 之后
    pub fn schedule_recurring(
        &self,
        task: NewTask,
        initial_delay: Duration,
        period: Duration,
    ) -> SchedulerResult<TaskHandle> {
        if period.is_zero() {
            return Err(SchedulerError::invariant("周期任务的周期必须大于0"));
        }
        self.submit(task, Recurrence::Periodic { period }, initial_delay)
    }

    fn submit(
        &self,
        task: NewTask,
        recurrence: Recurrence,
        delay: Duration,
    ) -> SchedulerResult<TaskHandle> {
        let inner = &self.inner;
        if inner.is_shutdown() {
            return Err(SchedulerError::SchedulerShutdown);
        }
        inner.ensure_owned(&task.identity)?;

        let id = TaskId {
            node: inner.node_id,
            seq: inner.next_seq.fetch_add(1, Ordering::SeqCst),
        };
        let now = Instant::now();
        let scheduled = ScheduledTask::new(id, task, recurrence, now + delay);

        let priority = scheduled.priority().as_str();
        inner
            .metrics
            .record_task_scheduled(scheduled.task_type(), priority);
        StructuredLogger::log_task_scheduled(
            id,
            scheduled.task_type(),
            priority,
            delay.as_millis() as u64,
        );

        let handle = TaskHandle {
            id,
            cancelled: scheduled.cancel_flag(),
            inner: Arc::downgrade(inner),
        };
        inner.enqueue(scheduled);
        Ok(handle)
    }

    /// 接收从其他节点迁移过来的任务，保留其运行状态
    ///
    /// 归属在任务运行前重新检查，不在这里拒绝。
    pub fn adopt(&self, task: ScheduledTask) -> SchedulerResult<()> {
        if self.inner.is_shutdown() {
            return Err(SchedulerError::SchedulerShutdown);
        }
        debug!(node_id = %self.inner.node_id, task_id = %task.id(), "接收迁移任务");
        self.inner.enqueue(task);
        Ok(())
    }

    /// 取出队列中的全部任务，用于节点下线时转交
    pub fn drain_pending(&self) -> Vec<ScheduledTask> {
        let mut queues = lock_unpoisoned(&self.inner.queues);
        let mut tasks = queues.ready.drain();
        tasks.extend(queues.delayed.drain());
        self.inner.metrics.update_queue_depth(0);
        tasks
    }

    pub fn pending_count(&self) -> usize {
        lock_unpoisoned(&self.inner.queues).depth()
    }

    pub fn ready_count(&self) -> usize {
        lock_unpoisoned(&self.inner.queues).ready.len()
    }

    pub fn delayed_count(&self) -> usize {
        lock_unpoisoned(&self.inner.queues).delayed.len()
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.is_shutdown()
    }

    /// 等待下一个可运行的任务，调度器关闭后返回 `None`
    pub async fn dequeue_next(&self) -> Option<ScheduledTask> {
        self.inner.dequeue_next().await
    }

    /// 启动调度循环，重复调用无效果
    pub fn start(&self) {
        let mut dispatcher = lock_unpoisoned(&self.inner.dispatcher);
        if dispatcher.is_some() {
            return;
        }
        info!(
            node_id = %self.inner.node_id,
            workers = self.inner.workers.max_workers(),
            retry_policy = self.inner.retry_policy.name(),
            "启动任务调度器"
        );
        *dispatcher = Some(tokio::spawn(dispatch_loop(Arc::clone(&self.inner))));
    }

    /// 停止调度并等待在途事务结束
    ///
    /// 超时返回 `false`；队列中尚未运行的任务保留在队列中。
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        let inner = &self.inner;
        if !inner.shutdown.swap(true, Ordering::SeqCst) {
            info!(node_id = %inner.node_id, pending = self.pending_count(), "正在关闭任务调度器");
        }
        inner.task_available.notify_waiters();
        inner.task_available.notify_one();

        let drained = inner.workers.shutdown(timeout).await;
        let dispatcher = lock_unpoisoned(&inner.dispatcher).take();
        if let Some(handle) = dispatcher {
            if let Err(e) = handle.await {
                warn!(node_id = %inner.node_id, error = %e, "调度循环异常退出");
            }
        }
        info!(node_id = %inner.node_id, drained, "任务调度器已关闭");
        drained
    }
}

async fn dispatch_loop(inner: Arc<SchedulerInner>) {
    loop {
        // 先取得工作者名额再出队，池满时任务留在队列里
        let permit = match inner.workers.acquire_worker().await {
            Ok(permit) => permit,
            Err(_) => break,
        };
        let Some(task) = inner.dequeue_next().await else {
            break;
        };

        let label = format!("{}:{}", task.id(), task.task_type());
        let runner = Arc::clone(&inner);
        inner
            .workers
            .spawn(permit, label, async move { runner.run_task(task).await })
            .await;
    }
    debug!(node_id = %inner.node_id, "调度循环已退出");
}

impl SchedulerInner {
    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    fn ensure_owned(&self, identity: &IdentityId) -> SchedulerResult<()> {
        match self.ownership.location(identity) {
            IdentityLocation::Owned(owner) if owner == self.node_id => Ok(()),
            IdentityLocation::Owned(owner) => Err(SchedulerError::IdentityNotOwned {
                identity: identity.to_string(),
                owner: Some(owner),
            }),
            IdentityLocation::InTransit { .. } => Err(SchedulerError::IdentityInTransit {
                identity: identity.to_string(),
            }),
            IdentityLocation::Unassigned => Err(SchedulerError::IdentityNotOwned {
                identity: identity.to_string(),
                owner: None,
            }),
        }
    }

    fn enqueue(&self, task: ScheduledTask) {
        let now = Instant::now();
        let depth = {
            let mut queues = lock_unpoisoned(&self.queues);
            if task.next_run_at() <= now {
                queues.ready.push(task);
            } else {
                queues.delayed.push(task);
            }
            queues.depth()
        };
        self.metrics.update_queue_depth(depth);
        self.task_available.notify_one();
    }

    fn remove_queued(&self, id: TaskId) -> bool {
        let mut queues = lock_unpoisoned(&self.queues);
        let removed = queues.ready.remove(id).or_else(|| queues.delayed.remove(id));
        if removed.is_some() {
            debug!(node_id = %self.node_id, task_id = %id, "任务在运行前被取消");
        }
        removed.is_some()
    }

    async fn dequeue_next(&self) -> Option<ScheduledTask> {
        loop {
            let notified = self.task_available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_shutdown() {
                return None;
            }

            let next_deadline = {
                let mut guard = lock_unpoisoned(&self.queues);
                let queues = &mut *guard;
                for task in queues.delayed.pop_due(Instant::now()) {
                    queues.ready.push(task);
                }
                if let Some(task) = queues.ready.pop() {
                    self.metrics.update_queue_depth(queues.depth());
                    return Some(task);
                }
                queues.delayed.next_deadline()
            };

            match next_deadline {
                Some(deadline) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(deadline) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    async fn run_task(self: Arc<Self>, mut task: ScheduledTask) {
        if task.is_cancelled() {
            debug!(task_id = %task.id(), "跳过已取消的任务");
            return;
        }

        // 出队后归属可能已经变化
        match self.ownership.location(task.identity()) {
            IdentityLocation::Owned(owner) if owner == self.node_id => {}
            IdentityLocation::Owned(owner) => {
                self.relocate(task, owner).await;
                return;
            }
            IdentityLocation::InTransit { .. } => {
                self.defer(task);
                return;
            }
            IdentityLocation::Unassigned => {
                let failure = TaskFailure::relocated(format!("身份 {} 已没有归属节点", task.identity()));
                self.drop_task(&task, Some(&failure));
                return;
            }
        }

        let started = Instant::now();
        let mut txn = self
            .transactions
            .begin(task.task_type(), task.requested_start());
        task.set_requested_start(txn.requested_start());

        let body = Arc::clone(task.body());
        let ran = AssertUnwindSafe(body.run(&mut txn)).catch_unwind().await;
        let ran = ran.unwrap_or_else(|panic| {
            let message = panic_message(panic.as_ref());
            warn!(task_id = %task.id(), task_type = %task.task_type(), panic = %message, "任务体发生panic");
            Err(TaskFailure::generic(format!("任务体panic: {message}")))
        });
        let outcome = match ran {
            Ok(()) if !txn.must_abort() => match txn.prepare_and_commit().await {
                Ok(()) => Ok(()),
                Err(error) => Err(txn
                    .abort_cause()
                    .cloned()
                    .unwrap_or_else(|| TaskFailure::invariant(&error))),
            },
            // 任务体吞掉了锁冲突，事务仍按竞争中止
            Ok(()) => Err(abort_transaction(&mut txn, TaskFailure::generic("任务体忽略了锁冲突")).await),
            Err(failure) => Err(abort_transaction(&mut txn, failure).await),
        };
        let txn_id = txn.id();
        drop(txn);

        match outcome {
            Ok(()) => {
                self.metrics
                    .record_task_committed(task.task_type(), started.elapsed().as_secs_f64());
                StructuredLogger::log_task_committed(
                    task.id(),
                    txn_id,
                    task.task_type(),
                    task.try_count(),
                );
                self.after_commit(task).await;
            }
            Err(failure) => self.after_failure(task, failure).await,
        }
    }

    async fn after_commit(&self, mut task: ScheduledTask) {
        if task.is_cancelled() {
            return;
        }
        let Some(next_run_at) = task
            .recurrence()
            .next_after(task.next_run_at(), Instant::now())
        else {
            return;
        };
        task.rearm(next_run_at);
        self.route(task).await;
    }

    async fn after_failure(&self, mut task: ScheduledTask, failure: TaskFailure) {
        task.record_failure(failure);
        if task.is_cancelled() {
            debug!(task_id = %task.id(), "已取消的任务失败后不再重试");
            return;
        }

        let decision = match self.retry_policy.decide(&task) {
            Ok(decision) => decision,
            Err(error) => {
                StructuredLogger::log_invariant_violation("retry_policy", &error.to_string());
                self.drop_task(&task, task.last_failure());
                return;
            }
        };

        let now = Instant::now();
        match decision {
            RetryDecision::Drop => self.drop_task(&task, task.last_failure()),
            RetryDecision::RetryNow => {
                self.record_retry(&task);
                task.set_next_run_at(now);
                self.route(task).await;
            }
            RetryDecision::RetryLater(delay) => {
                self.record_retry(&task);
                task.set_next_run_at(now + delay);
                self.route(task).await;
            }
        }
    }

    fn record_retry(&self, task: &ScheduledTask) {
        self.metrics
            .record_task_retry(task.task_type(), task.try_count());
        if let Some(failure) = task.last_failure() {
            StructuredLogger::log_task_retry(task.id(), task.task_type(), task.try_count(), failure);
        }
    }

    /// 按当前归属决定任务回到本地队列、迁移还是延后
    async fn route(&self, task: ScheduledTask) {
        match self.ownership.location(task.identity()) {
            IdentityLocation::Owned(owner) if owner == self.node_id => self.enqueue(task),
            IdentityLocation::Owned(owner) => self.relocate(task, owner).await,
            IdentityLocation::InTransit { .. } => self.defer(task),
            IdentityLocation::Unassigned => {
                let failure = TaskFailure::relocated(format!("身份 {} 已没有归属节点", task.identity()));
                self.drop_task(&task, Some(&failure));
            }
        }
    }

    fn defer(&self, mut task: ScheduledTask) {
        debug!(
            task_id = %task.id(),
            identity = %task.identity(),
            delay_ms = self.relocation_retry_delay.as_millis() as u64,
            "身份正在迁移，延后执行任务"
        );
        let next_run_at = task.next_run_at().max(Instant::now() + self.relocation_retry_delay);
        task.set_next_run_at(next_run_at);
        self.enqueue(task);
    }

    async fn relocate(&self, task: ScheduledTask, new_owner: NodeId) {
        let relocator = self
            .relocator
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let Some(relocator) = relocator else {
            let failure = TaskFailure::relocated(format!("身份已归属 {new_owner}，但没有安装任务迁移器"));
            self.drop_task(&task, Some(&failure));
            return;
        };

        let task_id = task.id();
        let identity = task.identity().clone();
        let task_type = task.task_type().to_string();
        let try_count = task.try_count();
        let recurring = task.is_recurring();
        match relocator.relocate(task, new_owner).await {
            Ok(()) => {
                self.metrics.record_task_relocated();
                StructuredLogger::log_task_relocated(task_id, &identity, new_owner);
            }
            Err(error) => {
                let failure = TaskFailure::relocated(format!("迁移到 {new_owner} 失败: {error}"));
                self.metrics.record_task_dropped(&task_type);
                StructuredLogger::log_task_dropped(
                    task_id,
                    &task_type,
                    try_count,
                    Some(&failure),
                    recurring,
                );
            }
        }
    }

    fn drop_task(&self, task: &ScheduledTask, failure: Option<&TaskFailure>) {
        self.metrics.record_task_dropped(task.task_type());
        StructuredLogger::log_task_dropped(
            task.id(),
            task.task_type(),
            task.try_count(),
            failure,
            task.is_recurring(),
        );
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|message| message.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "<非字符串panic>".to_string())
}

/// 中止事务并返回最终的失败原因
///
/// 事务内记录的竞争冲突优先于任务体返回的失败。
async fn abort_transaction(txn: &mut Transaction, failure: TaskFailure) -> TaskFailure {
    if txn.state() != TransactionState::Aborted {
        if let Err(error) = txn.abort(failure.clone()).await {
            return TaskFailure::invariant(&error);
        }
    }
    txn.abort_cause().cloned().unwrap_or(failure)
}
