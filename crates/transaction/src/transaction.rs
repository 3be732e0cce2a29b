use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use scheduler_core::{
    ConflictingTask, ContentionReport, LockConflict, LockType, ObjectId, Participant,
    PrepareVote, SchedulerError, SchedulerResult, TaskFailure, TxnId,
};
use scheduler_infrastructure::{MetricsCollector, StructuredLogger};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::lock_tracker::{LockOutcome, LockTracker};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Active,
    Preparing,
    Committed,
    Aborted,
}

impl TransactionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TransactionState::Committed | TransactionState::Aborted)
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionState::Active => f.write_str("ACTIVE"),
            TransactionState::Preparing => f.write_str("PREPARING"),
            TransactionState::Committed => f.write_str("COMMITTED"),
            TransactionState::Aborted => f.write_str("ABORTED"),
        }
    }
}

/// 一次任务执行对应的事务
///
/// 同一时刻只被一个工作者持有，因此所有状态变更都通过 `&mut self`。
/// 提交或中止完成后，事务持有的锁全部释放。
pub struct Transaction {
    id: TxnId,
    task_type: String,
    requested_start: u64,
    created_at: Instant,
    timeout: Duration,
    state: TransactionState,
    participants: Vec<Arc<dyn Participant>>,
    tracker: Arc<LockTracker>,
    /// 任务体收到但可能吞掉的锁冲突
    pending_conflict: Option<LockConflict>,
    abort_cause: Option<TaskFailure>,
    report: Option<ContentionReport>,
    metrics: MetricsCollector,
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("task_type", &self.task_type)
            .field("state", &self.state)
            .field("participants", &self.participants.len())
            .finish()
    }
}

impl Transaction {
    pub(crate) fn new(
        id: TxnId,
        task_type: &str,
        requested_start: u64,
        timeout: Duration,
        tracker: Arc<LockTracker>,
        metrics: MetricsCollector,
    ) -> Self {
        tracker.register(id, requested_start, task_type);
        Self {
            id,
            task_type: task_type.to_string(),
            requested_start,
            created_at: Instant::now(),
            timeout,
            state: TransactionState::Active,
            participants: Vec::new(),
            tracker,
            pending_conflict: None,
            abort_cause: None,
            report: None,
            metrics,
        }
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn task_type(&self) -> &str {
        &self.task_type
    }

    pub fn requested_start(&self) -> u64 {
        self.requested_start
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn participant_count(&self) -> usize {
        self.participants.len()
    }

    pub fn abort_cause(&self) -> Option<&TaskFailure> {
        self.abort_cause.as_ref()
    }

    /// 因竞争中止时生成的诊断快照
    pub fn contention_report(&self) -> Option<&ContentionReport> {
        self.report.as_ref()
    }

    pub fn take_contention_report(&mut self) -> Option<ContentionReport> {
        self.report.take()
    }

    /// 是否已经无法提交：已中止，或者任务体遇到过锁冲突
    pub fn must_abort(&self) -> bool {
        self.state == TransactionState::Aborted || self.pending_conflict.is_some()
    }

    pub fn is_timed_out(&self) -> bool {
        self.created_at.elapsed() > self.timeout
    }

    /// 加入参与者，同一参与者重复加入只记一次
    pub fn join(&mut self, participant: Arc<dyn Participant>) -> SchedulerResult<()> {
        self.ensure_active("join")?;
        let already_joined = self
            .participants
            .iter()
            .any(|joined| same_participant(joined, &participant));
        if !already_joined {
            debug!(txn_id = %self.id, participant = participant.name(), "参与者加入事务");
            self.participants.push(participant);
        }
        Ok(())
    }

    /// 在事务中获取对象锁
    ///
    /// 冲突会记在事务上，即使任务体忽略返回的失败，事务也不会提交。
    pub async fn lock(
        &mut self,
        object_id: ObjectId,
        bound_name: Option<&str>,
        lock_type: LockType,
    ) -> Result<(), TaskFailure> {
        if let Err(error) = self.ensure_active("lock") {
            return Err(TaskFailure::invariant(&error));
        }
        if let Some(conflict) = &self.pending_conflict {
            return Err(TaskFailure::contention(conflict.clone()));
        }

        let outcome = self
            .tracker
            .acquire(self.id, object_id, bound_name, lock_type)
            .await;
        match outcome {
            Ok(LockOutcome::Granted) => Ok(()),
            Ok(LockOutcome::WouldBlock(conflict)) | Ok(LockOutcome::Denied(conflict)) => {
                self.pending_conflict = Some(conflict.clone());
                Err(TaskFailure::contention(conflict))
            }
            Err(error) => {
                StructuredLogger::log_invariant_violation("transaction", &error.to_string());
                Err(TaskFailure::invariant(&error))
            }
        }
    }

    /// 中止事务
    ///
    /// 通知全部参与者、释放锁；竞争导致的中止会先生成 `ContentionReport`。
    pub async fn abort(&mut self, cause: TaskFailure) -> SchedulerResult<()> {
        if self.state.is_terminal() {
            let error = self.not_active();
            StructuredLogger::log_invariant_violation("transaction", &error.to_string());
            return Err(error);
        }
        self.state = TransactionState::Aborted;

        for participant in &self.participants {
            if let Err(e) = participant.abort(self.id).await {
                warn!(
                    txn_id = %self.id,
                    participant = participant.name(),
                    error = %e,
                    "参与者中止回调失败"
                );
            }
        }

        let cause = match self.pending_conflict.take() {
            // 任务体把冲突转成了别的失败，仍按竞争中止处理
            Some(conflict) if !cause.is_contention() => TaskFailure::contention(conflict),
            _ => cause,
        };

        if cause.is_contention() {
            if let Some(conflict) = &cause.conflict {
                let report = self.build_report(conflict);
                StructuredLogger::log_contention_report(&report);
                self.report = Some(report);
            }
        }

        self.tracker.release_all(self.id);
        self.metrics
            .record_transaction_abort(&cause.conflict_type().to_string());
        debug!(txn_id = %self.id, cause = %cause, "事务已中止");
        self.abort_cause = Some(cause);
        Ok(())
    }

    /// 两阶段提交
    ///
    /// 任一参与者准备失败即中止并返回 `TransactionAborted`；全部准备成功后
    /// 提交回调的失败只记录日志。
    pub async fn prepare_and_commit(&mut self) -> SchedulerResult<()> {
        self.ensure_active("prepare_and_commit")
            .inspect_err(|e| StructuredLogger::log_invariant_violation("transaction", &e.to_string()))?;

        if let Some(conflict) = self.pending_conflict.clone() {
            return self.abort_with(TaskFailure::contention(conflict)).await;
        }
        if self.is_timed_out() {
            let failure = TaskFailure::timeout(format!(
                "事务 {} 运行 {:?} 超过了超时时间 {:?}",
                self.id,
                self.created_at.elapsed(),
                self.timeout
            ));
            return self.abort_with(failure).await;
        }

        self.state = TransactionState::Preparing;
        let participants = self.participants.clone();
        let mut to_commit = Vec::with_capacity(participants.len());
        for participant in &participants {
            match participant.prepare(self.id).await {
                Ok(PrepareVote::Prepared) => to_commit.push(participant.clone()),
                Ok(PrepareVote::ReadOnly) => {
                    debug!(txn_id = %self.id, participant = participant.name(), "参与者只读，跳过提交");
                }
                Err(e) => {
                    let failure = TaskFailure::participant_veto(participant.name(), e.to_string());
                    return self.abort_with(failure).await;
                }
            }
        }

        self.state = TransactionState::Committed;
        for participant in &to_commit {
            if let Err(e) = participant.commit(self.id).await {
                warn!(
                    txn_id = %self.id,
                    participant = participant.name(),
                    error = %e,
                    "参与者提交回调失败"
                );
            }
        }

        self.tracker.release_all(self.id);
        debug!(txn_id = %self.id, participants = to_commit.len(), "事务已提交");
        Ok(())
    }

    async fn abort_with(&mut self, cause: TaskFailure) -> SchedulerResult<()> {
        let message = cause.to_string();
        self.abort(cause).await?;
        Err(SchedulerError::TransactionAborted {
            txn_id: self.id,
            cause: message,
        })
    }

    fn build_report(&self, conflict: &LockConflict) -> ContentionReport {
        let conflicting_task = conflict.conflicting_txn.map(|txn_id| ConflictingTask {
            txn_id,
            task_type: self.tracker.task_type_of(txn_id),
        });
        ContentionReport::new(
            self.id,
            self.task_type.clone(),
            self.tracker.acquired_locks(self.id),
            vec![conflict.requested.clone()],
            conflict.conflict_type,
            conflicting_task,
        )
    }

    fn ensure_active(&self, operation: &str) -> SchedulerResult<()> {
        if self.state == TransactionState::Active {
            Ok(())
        } else {
            debug!(txn_id = %self.id, operation, state = %self.state, "事务已不可用");
            Err(self.not_active())
        }
    }

    fn not_active(&self) -> SchedulerError {
        SchedulerError::TransactionNotActive {
            txn_id: self.id,
            state: self.state.to_string(),
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.state.is_terminal() {
            self.tracker.release_all(self.id);
        }
    }
}

fn same_participant(a: &Arc<dyn Participant>, b: &Arc<dyn Participant>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}
