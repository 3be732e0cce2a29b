use std::time::Duration;

use scheduler_core::{ConflictType, LockType, ObjectId, TransactionConfig};
use scheduler_transaction::{TransactionCoordinator, TransactionState};
use std::sync::Arc;

const ACCOUNT_A: ObjectId = ObjectId(100);
const ACCOUNT_B: ObjectId = ObjectId(200);

#[tokio::test]
async fn test_opposite_lock_order_aborts_exactly_one() {
    let coordinator = Arc::new(TransactionCoordinator::new(&TransactionConfig::default()));
    let mut first = coordinator.begin("transfer-a-to-b", None);
    let mut second = coordinator.begin("transfer-b-to-a", None);

    first.lock(ACCOUNT_A, None, LockType::Write).await.unwrap();
    second.lock(ACCOUNT_B, None, LockType::Write).await.unwrap();

    // first 等待 B
    let first_task = tokio::spawn(async move {
        let result = first.lock(ACCOUNT_B, None, LockType::Write).await;
        (first, result)
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    // second 请求 A 形成环，后开始的 second 被选为牺牲者
    let failure = second
        .lock(ACCOUNT_A, None, LockType::Write)
        .await
        .unwrap_err();
    assert_eq!(failure.conflict_type(), ConflictType::Deadlock);
    assert_eq!(failure.retryable, Some(true));

    second.abort(failure).await.unwrap();
    assert_eq!(second.state(), TransactionState::Aborted);

    let report = second.contention_report().unwrap();
    assert_eq!(report.txn_id(), second.id());
    assert_eq!(report.task_type(), "transfer-b-to-a");
    assert_eq!(report.conflict_type(), ConflictType::Deadlock);
    assert_eq!(report.acquired_locks().len(), 1);
    assert_eq!(report.acquired_locks()[0].object_id, ACCOUNT_B);
    assert_eq!(report.contended_locks()[0].object_id, ACCOUNT_A);
    let conflicting = report.conflicting_task().unwrap();
    assert_eq!(
        conflicting.task_type.as_deref(),
        Some("transfer-a-to-b")
    );

    // 另一个事务拿到锁并正常提交
    let (mut first, result) = first_task.await.unwrap();
    result.unwrap();
    first.prepare_and_commit().await.unwrap();
    assert_eq!(first.state(), TransactionState::Committed);
    assert!(coordinator.tracker().holders(ACCOUNT_A).is_empty());
    assert!(coordinator.tracker().holders(ACCOUNT_B).is_empty());
}

#[tokio::test]
async fn test_retried_transaction_keeps_its_age() {
    let coordinator = Arc::new(TransactionCoordinator::new(&TransactionConfig::default()));

    // 旧任务重试时沿用最初的 requested_start，因此比新事务“更老”
    let mut fresh = coordinator.begin("fresh", None);
    let mut retried = coordinator.begin("retried", Some(0));
    assert!(retried.requested_start() < fresh.requested_start());

    retried.lock(ACCOUNT_A, None, LockType::Write).await.unwrap();
    fresh.lock(ACCOUNT_B, None, LockType::Write).await.unwrap();

    let retried_task = tokio::spawn(async move {
        let result = retried.lock(ACCOUNT_B, None, LockType::Write).await;
        (retried, result)
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let failure = fresh
        .lock(ACCOUNT_A, None, LockType::Write)
        .await
        .unwrap_err();
    assert_eq!(failure.conflict_type(), ConflictType::Deadlock);
    fresh.abort(failure).await.unwrap();

    let (mut retried, result) = retried_task.await.unwrap();
    result.unwrap();
    retried.prepare_and_commit().await.unwrap();
}
