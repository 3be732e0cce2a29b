use std::fmt;

use serde::{Deserialize, Serialize};

use super::{ObjectId, TxnId};

/// 锁类型：读锁共享，写锁独占
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LockType {
    Read,
    Write,
}

impl LockType {
    pub fn is_write(self) -> bool {
        matches!(self, LockType::Write)
    }
}

impl fmt::Display for LockType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockType::Read => f.write_str("READ"),
            LockType::Write => f.write_str("WRITE"),
        }
    }
}

/// 获取锁时记录的信息，保留在所属事务上直到提交或中止
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    pub object_id: ObjectId,
    pub bound_name: Option<String>,
    pub lock_type: LockType,
}

impl LockInfo {
    pub fn new(object_id: ObjectId, bound_name: Option<&str>, lock_type: LockType) -> Self {
        Self {
            object_id,
            bound_name: bound_name.map(str::to_string),
            lock_type,
        }
    }
}

/// 冲突分类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConflictType {
    Deadlock,
    LockNotGranted,
    Unknown,
}

impl fmt::Display for ConflictType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictType::Deadlock => f.write_str("DEADLOCK"),
            ConflictType::LockNotGranted => f.write_str("LOCK_NOT_GRANTED"),
            ConflictType::Unknown => f.write_str("UNKNOWN"),
        }
    }
}

/// 锁请求未被授予时的冲突描述
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockConflict {
    pub conflict_type: ConflictType,
    /// 未能获得的锁
    pub requested: LockInfo,
    /// 冲突方事务，未知时为 None
    pub conflicting_txn: Option<TxnId>,
}

impl fmt::Display for LockConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} on {} ({})",
            self.conflict_type, self.requested.object_id, self.requested.lock_type
        )?;
        if let Some(txn) = self.conflicting_txn {
            write!(f, " with {txn}")?;
        }
        Ok(())
    }
}
