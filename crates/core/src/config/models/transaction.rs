use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionConfig {
    /// 事务超时（毫秒）
    pub timeout_ms: u64,
    /// 等待锁的超时（毫秒），超时后冲突归类为 LOCK_NOT_GRANTED
    pub lock_timeout_ms: u64,
    /// 锁表分片数
    pub lock_shards: usize,
    pub detect_deadlocks: bool,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            lock_timeout_ms: 1_000,
            lock_shards: 16,
            detect_deadlocks: true,
        }
    }
}

impl TransactionConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.timeout_ms == 0 {
            return Err(anyhow::anyhow!("事务超时必须大于0"));
        }

        if self.lock_timeout_ms == 0 {
            return Err(anyhow::anyhow!("锁等待超时必须大于0"));
        }

        if self.lock_shards == 0 {
            return Err(anyhow::anyhow!("锁表分片数必须大于0"));
        }

        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}
