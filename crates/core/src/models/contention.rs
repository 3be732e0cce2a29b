use serde::{Deserialize, Serialize};

use super::{ConflictType, LockInfo, TxnId};

/// 冲突方事务的信息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictingTask {
    pub txn_id: TxnId,
    pub task_type: Option<String>,
}

/// 事务因竞争中止时生成的只读诊断快照
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentionReport {
    txn_id: TxnId,
    task_type: String,
    acquired_locks: Vec<LockInfo>,
    contended_locks: Vec<LockInfo>,
    conflict_type: ConflictType,
    conflicting_task: Option<ConflictingTask>,
}

impl ContentionReport {
    pub fn new(
        txn_id: TxnId,
        task_type: impl Into<String>,
        acquired_locks: Vec<LockInfo>,
        contended_locks: Vec<LockInfo>,
        conflict_type: ConflictType,
        conflicting_task: Option<ConflictingTask>,
    ) -> Self {
        Self {
            txn_id,
            task_type: task_type.into(),
            acquired_locks,
            contended_locks,
            conflict_type,
            conflicting_task,
        }
    }

    /// 被中止事务的标识
    pub fn txn_id(&self) -> TxnId {
        self.txn_id
    }

    /// 被中止事务所执行的任务类型
    pub fn task_type(&self) -> &str {
        &self.task_type
    }

    /// 按获取顺序排列的已获得锁
    pub fn acquired_locks(&self) -> &[LockInfo] {
        &self.acquired_locks
    }

    /// 发生竞争的锁，冲突方未知时可能为空
    pub fn contended_locks(&self) -> &[LockInfo] {
        &self.contended_locks
    }

    pub fn conflict_type(&self) -> ConflictType {
        self.conflict_type
    }

    pub fn conflicting_task(&self) -> Option<&ConflictingTask> {
        self.conflicting_task.as_ref()
    }
}
