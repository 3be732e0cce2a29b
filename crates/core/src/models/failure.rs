use std::fmt;

use serde::{Deserialize, Serialize};

use super::{ConflictType, LockConflict};

/// 任务失败的来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// 锁竞争导致的中止
    Contention(ConflictType),
    /// 任务体自身抛出的错误
    Application,
    /// 事务超时
    Timeout,
    /// 参与者在准备阶段拒绝
    ParticipantVeto,
    /// 身份已迁移到其他节点
    Relocated,
    /// 任务体触发了调度器不变量错误
    Invariant,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Contention(conflict) => write!(f, "contention({conflict})"),
            FailureKind::Application => f.write_str("application"),
            FailureKind::Timeout => f.write_str("timeout"),
            FailureKind::ParticipantVeto => f.write_str("participant_veto"),
            FailureKind::Relocated => f.write_str("relocated"),
            FailureKind::Invariant => f.write_str("invariant"),
        }
    }
}

/// 任务执行失败的原因
///
/// `retryable` 是失败自身携带的重试信号：`Some(true)` 请求重试，
/// `Some(false)` 明确拒绝重试，`None` 表示失败不感知重试。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct TaskFailure {
    pub kind: FailureKind,
    pub message: String,
    pub retryable: Option<bool>,
    pub conflict: Option<LockConflict>,
}

impl TaskFailure {
    /// 明确请求重试的应用失败
    pub fn retryable(message: impl Into<String>) -> Self {
        Self::application(message, Some(true))
    }

    /// 明确拒绝重试的应用失败
    pub fn non_retryable(message: impl Into<String>) -> Self {
        Self::application(message, Some(false))
    }

    /// 不携带重试信号的普通失败
    pub fn generic(message: impl Into<String>) -> Self {
        Self::application(message, None)
    }

    fn application(message: impl Into<String>, retryable: Option<bool>) -> Self {
        Self {
            kind: FailureKind::Application,
            message: message.into(),
            retryable,
            conflict: None,
        }
    }

    /// 锁竞争失败总是可以重试
    pub fn contention(conflict: LockConflict) -> Self {
        Self {
            kind: FailureKind::Contention(conflict.conflict_type),
            message: conflict.to_string(),
            retryable: Some(true),
            conflict: Some(conflict),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Timeout,
            message: message.into(),
            retryable: None,
            conflict: None,
        }
    }

    pub fn participant_veto(participant: &str, message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::ParticipantVeto,
            message: format!("{participant}: {}", message.into()),
            retryable: None,
            conflict: None,
        }
    }

    pub fn relocated(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Relocated,
            message: message.into(),
            retryable: Some(true),
            conflict: None,
        }
    }

    /// 不变量错误交给任务体后不再重试
    pub fn invariant(error: &crate::errors::SchedulerError) -> Self {
        Self {
            kind: FailureKind::Invariant,
            message: error.to_string(),
            retryable: Some(false),
            conflict: None,
        }
    }

    pub fn is_contention(&self) -> bool {
        matches!(self.kind, FailureKind::Contention(_))
    }

    pub fn conflict_type(&self) -> ConflictType {
        match self.kind {
            FailureKind::Contention(conflict) => conflict,
            _ => ConflictType::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{LockInfo, LockType, ObjectId, TxnId};

    #[test]
    fn test_contention_failure_is_retryable() {
        let conflict = LockConflict {
            conflict_type: ConflictType::Deadlock,
            requested: LockInfo::new(ObjectId(1), None, LockType::Write),
            conflicting_txn: Some(TxnId(2)),
        };
        let failure = TaskFailure::contention(conflict);
        assert!(failure.is_contention());
        assert_eq!(failure.retryable, Some(true));
        assert_eq!(failure.conflict_type(), ConflictType::Deadlock);
    }

    #[test]
    fn test_retry_signals() {
        assert_eq!(TaskFailure::retryable("x").retryable, Some(true));
        assert_eq!(TaskFailure::non_retryable("x").retryable, Some(false));
        assert_eq!(TaskFailure::generic("x").retryable, None);
        assert_eq!(TaskFailure::generic("x").conflict_type(), ConflictType::Unknown);
    }

    #[test]
    fn test_invariant_failure_never_retries() {
        let failure = TaskFailure::invariant(&crate::errors::SchedulerError::invariant("bad"));
        assert_eq!(failure.kind, FailureKind::Invariant);
        assert_eq!(failure.retryable, Some(false));
    }
}
