use thiserror::Error;

use crate::models::{NodeId, TxnId};

/// 调度器错误类型定义
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SchedulerError {
    /// 编程错误：调用方违反了调度器的不变量
    #[error("调度器不变量被破坏: {0}")]
    InvariantViolation(String),

    #[error("事务 {txn_id} 已不处于活跃状态: {state}")]
    TransactionNotActive { txn_id: TxnId, state: String },

    #[error("事务 {txn_id} 已中止: {cause}")]
    TransactionAborted { txn_id: TxnId, cause: String },

    #[error("无法比较不兼容的优先级: {left} 与 {right}")]
    IncompatiblePriority { left: String, right: String },

    #[error("参与者 {participant} 拒绝提交: {message}")]
    ParticipantVeto { participant: String, message: String },

    #[error("没有可用的节点")]
    NoNodesAvailable,

    #[error("身份 {identity} 不属于当前节点 (当前归属: {owner:?})")]
    IdentityNotOwned {
        identity: String,
        owner: Option<NodeId>,
    },

    #[error("身份 {identity} 正在迁移中")]
    IdentityInTransit { identity: String },

    #[error("节点未找到: {id}")]
    NodeNotFound { id: NodeId },

    #[error("调度器已关闭")]
    SchedulerShutdown,

    #[error("节点协调器已关闭")]
    CoordinatorShutdown,

    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("内部错误: {0}")]
    Internal(String),
}

impl SchedulerError {
    /// 是否属于编程错误（不可恢复）
    pub fn is_invariant_violation(&self) -> bool {
        matches!(
            self,
            SchedulerError::InvariantViolation(_)
                | SchedulerError::TransactionNotActive { .. }
                | SchedulerError::IncompatiblePriority { .. }
                | SchedulerError::SchedulerShutdown
                | SchedulerError::CoordinatorShutdown
        )
    }

    pub fn invariant(message: impl Into<String>) -> Self {
        SchedulerError::InvariantViolation(message.into())
    }
}

/// 统一的Result类型
pub type Result<T> = std::result::Result<T, SchedulerError>;
