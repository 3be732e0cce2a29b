use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use scheduler_core::{TransactionConfig, TxnId};
use scheduler_infrastructure::MetricsCollector;
use tracing::trace;

use crate::lock_tracker::{LockTracker, LockTrackerConfig};
use crate::transaction::Transaction;

/// 创建事务并分配单调递增的序列号
///
/// 同一进程内共享对象存储的所有节点共用一个协调器，保证事务ID不重复。
pub struct TransactionCoordinator {
    next_id: AtomicU64,
    tracker: Arc<LockTracker>,
    timeout: Duration,
    metrics: MetricsCollector,
}

impl TransactionCoordinator {
    pub fn new(config: &TransactionConfig) -> Self {
        let tracker = Arc::new(LockTracker::new(LockTrackerConfig::from(config)));
        Self::with_tracker(tracker, config.timeout())
    }

    pub fn with_tracker(tracker: Arc<LockTracker>, timeout: Duration) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            tracker,
            timeout,
            metrics: MetricsCollector::new(),
        }
    }

    pub fn tracker(&self) -> &Arc<LockTracker> {
        &self.tracker
    }

    /// 开始一个新事务
    ///
    /// `requested_start` 为 `None` 时使用新事务的序列号；重试的任务传入首次运行时的值，
    /// 使其在死锁中越来越不容易被选为牺牲者。
    pub fn begin(&self, task_type: &str, requested_start: Option<u64>) -> Transaction {
        let serial = self.next_id.fetch_add(1, Ordering::SeqCst);
        let id = TxnId(serial);
        let requested_start = requested_start.unwrap_or(serial);
        trace!(txn_id = %id, task_type, requested_start, "开始事务");
        Transaction::new(
            id,
            task_type,
            requested_start,
            self.timeout,
            self.tracker.clone(),
            self.metrics.clone(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::TransactionState;

    #[test]
    fn test_ids_are_monotonic() {
        let coordinator = TransactionCoordinator::new(&TransactionConfig::default());
        let first = coordinator.begin("a", None);
        let second = coordinator.begin("b", None);

        assert!(second.id() > first.id());
        assert_eq!(first.requested_start(), first.id().0);
        assert_eq!(first.state(), TransactionState::Active);
        assert!(coordinator.tracker().is_registered(first.id()));
    }

    #[test]
    fn test_requested_start_survives_retry() {
        let coordinator = TransactionCoordinator::new(&TransactionConfig::default());
        let first = coordinator.begin("retry", None);
        let original_start = first.requested_start();
        drop(first);

        let retried = coordinator.begin("retry", Some(original_start));
        assert_ne!(retried.id().0, original_start);
        assert_eq!(retried.requested_start(), original_start);
    }

    #[test]
    fn test_dropping_active_transaction_releases_locks() {
        let coordinator = TransactionCoordinator::new(&TransactionConfig::default());
        let txn = coordinator.begin("dropped", None);
        let id = txn.id();
        coordinator
            .tracker()
            .try_acquire(id, scheduler_core::ObjectId(1), None, scheduler_core::LockType::Write)
            .unwrap();

        drop(txn);
        assert!(coordinator.tracker().holders(scheduler_core::ObjectId(1)).is_empty());
        assert!(!coordinator.tracker().is_registered(id));
    }
}
