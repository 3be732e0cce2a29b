use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use scheduler_core::{
    IdentityLocation, LockType, NodeId, ObjectId, Priority, RetryConfig, SchedulerResult,
    TaskFailure,
};
use scheduler_dispatcher::{
    BackoffRetryPolicy, ScheduledTask, TaskRelocator, TaskScheduler,
};
use scheduler_testing_utils::{
    CountingBody, FailingBody, LockingBody, PanickingBody, RecordingParticipant, StaticOwnership,
    TaskBuilder, TestEnv,
};
use tokio::time::{sleep, Instant};

#[derive(Default)]
struct RecordingRelocator {
    relocated: Mutex<Vec<(ScheduledTask, NodeId)>>,
}

#[async_trait]
impl TaskRelocator for RecordingRelocator {
    async fn relocate(&self, task: ScheduledTask, new_owner: NodeId) -> SchedulerResult<()> {
        self.relocated.lock().unwrap().push((task, new_owner));
        Ok(())
    }
}

#[tokio::test]
async fn test_fair_dequeue_follows_priority_weights() {
    let scheduler = TestEnv::scheduler(1, StaticOwnership::owned_by(1));
    let body = Arc::new(CountingBody::new("fairness"));
    for priority in [Priority::High, Priority::Normal, Priority::Low] {
        for _ in 0..1000 {
            let task = TaskBuilder::new()
                .with_body(body.clone())
                .with_priority(priority)
                .build();
            scheduler.schedule(task).unwrap();
        }
    }

    // 默认权重 HIGH:NORMAL:LOW = 8:4:2，在三个级别都未耗尽的窗口内按比例出队
    let mut counts = [0usize; 3];
    for _ in 0..1400 {
        let task = scheduler.dequeue_next().await.unwrap();
        match task.priority() {
            Priority::High => counts[0] += 1,
            Priority::Normal => counts[1] += 1,
            Priority::Low => counts[2] += 1,
            other => panic!("unexpected priority {other}"),
        }
    }
    assert!((790..=810).contains(&counts[0]), "high: {}", counts[0]);
    assert!((390..=410).contains(&counts[1]), "normal: {}", counts[1]);
    assert!((190..=210).contains(&counts[2]), "low: {}", counts[2]);

    // 剩余任务全部可以取出，低优先级不会被饿死
    let mut remaining = 0;
    while scheduler.pending_count() > 0 {
        scheduler.dequeue_next().await.unwrap();
        remaining += 1;
    }
    assert_eq!(remaining, 1600);
}

#[tokio::test(start_paused = true)]
async fn test_late_periodic_task_catches_up_once() {
    let scheduler = TestEnv::scheduler(1, StaticOwnership::owned_by(1));
    let blocker = Arc::new(CountingBody::new("blocker").with_hold(Duration::from_secs(3)));
    let periodic = Arc::new(CountingBody::new("periodic"));
    let start = Instant::now();

    scheduler
        .schedule(
            TaskBuilder::new()
                .with_body(blocker.clone())
                .with_priority(Priority::RealTime)
                .build(),
        )
        .unwrap();
    scheduler
        .schedule_recurring(
            TaskBuilder::new().with_body(periodic.clone()).build(),
            Duration::from_millis(500),
            Duration::from_millis(500),
        )
        .unwrap();
    scheduler.start();

    // 唯一的工作者被占用3秒，期间错过了六个周期
    sleep(Duration::from_millis(3400)).await;
    assert_eq!(blocker.runs(), 1);
    assert_eq!(periodic.runs(), 1);
    assert_eq!(periodic.run_times()[0], start + Duration::from_secs(3));

    // 之后恢复正常节奏
    sleep(Duration::from_millis(700)).await;
    let run_times = periodic.run_times();
    assert_eq!(run_times.len(), 3);
    assert_eq!(run_times[1], start + Duration::from_millis(3500));
    assert_eq!(run_times[2], start + Duration::from_millis(4000));

    assert!(scheduler.shutdown(Duration::from_secs(1)).await);
}

#[tokio::test]
async fn test_retryable_failure_is_retried_until_success() {
    let scheduler = TestEnv::scheduler(2, StaticOwnership::owned_by(1));
    let body = Arc::new(FailingBody::times(2, TaskFailure::retryable("busy")));
    scheduler
        .schedule(TaskBuilder::new().with_body(body.clone()).build())
        .unwrap();
    scheduler.start();

    assert!(TestEnv::wait_for(|| body.attempts() == 3, Duration::from_secs(5)).await);
    assert!(TestEnv::wait_for(|| scheduler.pending_count() == 0, Duration::from_secs(1)).await);
    assert!(scheduler.shutdown(Duration::from_secs(1)).await);
    assert_eq!(body.attempts(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_non_retryable_failure_is_dropped() {
    let scheduler = TestEnv::scheduler(2, StaticOwnership::owned_by(1));
    let body = Arc::new(FailingBody::always(TaskFailure::non_retryable("bad input")));
    scheduler
        .schedule(TaskBuilder::new().with_body(body.clone()).build())
        .unwrap();
    scheduler.start();

    sleep(Duration::from_secs(1)).await;
    assert_eq!(body.attempts(), 1);
    assert_eq!(scheduler.pending_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_dropping_periodic_task_ends_recurrence() {
    let scheduler = TestEnv::scheduler(2, StaticOwnership::owned_by(1));
    let body = Arc::new(FailingBody::always(TaskFailure::generic("boom")));
    scheduler
        .schedule_recurring(
            TaskBuilder::new().with_body(body.clone()).build(),
            Duration::ZERO,
            Duration::from_millis(100),
        )
        .unwrap();
    scheduler.start();

    sleep(Duration::from_secs(1)).await;
    assert_eq!(body.attempts(), 1);
    assert_eq!(scheduler.pending_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_panicking_body_is_aborted_and_dropped() {
    let scheduler = TestEnv::scheduler(1, StaticOwnership::owned_by(1));
    let participant = RecordingParticipant::new("ledger");
    let body = Arc::new(PanickingBody::new().with_participant(participant.clone()));
    scheduler
        .schedule_recurring(
            TaskBuilder::new().with_body(body.clone()).build(),
            Duration::ZERO,
            Duration::from_millis(100),
        )
        .unwrap();
    scheduler.start();

    sleep(Duration::from_secs(1)).await;
    assert_eq!(body.attempts(), 1);
    assert_eq!(participant.abort_count(), 1);
    assert_eq!(participant.commit_count(), 0);
    assert_eq!(scheduler.pending_count(), 0);

    // 唯一的工作者名额已归还
    let next = Arc::new(CountingBody::new("after_panic"));
    scheduler
        .schedule(TaskBuilder::new().with_body(next.clone()).build())
        .unwrap();
    assert!(TestEnv::wait_for(|| next.runs() == 1, Duration::from_secs(1)).await);
    assert!(scheduler.shutdown(Duration::from_secs(1)).await);
}

#[tokio::test(start_paused = true)]
async fn test_backoff_policy_gives_up_after_max_retries() {
    let policy = Arc::new(BackoffRetryPolicy::new(RetryConfig {
        base_interval_ms: 100,
        max_interval_ms: 1_000,
        backoff_multiplier: 2.0,
        jitter_factor: 0.0,
        max_retries: 2,
    }));
    let scheduler = TestEnv::scheduler_with_policy(1, StaticOwnership::owned_by(1), policy);
    let body = Arc::new(FailingBody::always(TaskFailure::retryable("busy")));
    scheduler
        .schedule(TaskBuilder::new().with_body(body.clone()).build())
        .unwrap();
    scheduler.start();

    sleep(Duration::from_millis(50)).await;
    assert_eq!(body.attempts(), 1);
    sleep(Duration::from_millis(100)).await;
    assert_eq!(body.attempts(), 2);
    sleep(Duration::from_secs(2)).await;
    assert_eq!(body.attempts(), 3);
    assert_eq!(scheduler.pending_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_before_run() {
    let scheduler = TestEnv::scheduler(1, StaticOwnership::owned_by(1));
    let body = Arc::new(CountingBody::new("cancelled"));
    let handle = scheduler
        .schedule_delayed(
            TaskBuilder::new().with_body(body.clone()).build(),
            Duration::from_secs(1),
        )
        .unwrap();
    scheduler.start();

    assert!(handle.cancel());
    sleep(Duration::from_secs(2)).await;
    assert_eq!(body.runs(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_stops_recurrence_after_current_run() {
    let scheduler = TestEnv::scheduler(1, StaticOwnership::owned_by(1));
    let body = Arc::new(CountingBody::new("periodic").with_hold(Duration::from_millis(50)));
    let handle = scheduler
        .schedule_recurring(
            TaskBuilder::new().with_body(body.clone()).build(),
            Duration::ZERO,
            Duration::from_millis(200),
        )
        .unwrap();
    scheduler.start();

    // 第一次运行进行中，取消不会打断它
    sleep(Duration::from_millis(10)).await;
    assert_eq!(body.runs(), 1);
    assert!(!handle.cancel());

    sleep(Duration::from_secs(1)).await;
    assert_eq!(body.runs(), 1);
    assert_eq!(scheduler.pending_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_swallowed_conflict_still_aborts() {
    let transactions = TestEnv::transaction_coordinator();
    let scheduler = TaskScheduler::new(
        NodeId(1),
        &TestEnv::scheduler_config(1),
        transactions.clone(),
        StaticOwnership::owned_by(1),
        Arc::new(scheduler_dispatcher::ImmediateRetryPolicy),
    );

    let mut holder = transactions.begin("holder", None);
    holder.lock(ObjectId(7), None, LockType::Write).await.unwrap();

    let participant = RecordingParticipant::new("ledger");
    let body = Arc::new(
        LockingBody::new("writer", vec![(ObjectId(7), LockType::Write)])
            .swallowing_conflicts()
            .with_participant(participant.clone()),
    );
    scheduler
        .schedule(TaskBuilder::new().with_body(body.clone()).build())
        .unwrap();
    scheduler.start();

    // 锁等待超时后任务体吞掉了冲突，事务仍然中止
    sleep(Duration::from_millis(1_200)).await;
    assert_eq!(body.failures().len(), 1);
    assert!(body.failures()[0].is_contention());
    assert_eq!(participant.abort_count(), 1);
    assert_eq!(participant.commit_count(), 0);

    // 竞争失败可重试，持有者释放后重试成功提交
    holder.abort(TaskFailure::generic("done")).await.unwrap();
    sleep(Duration::from_millis(100)).await;
    assert_eq!(body.runs(), 2);
    assert_eq!(participant.commit_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_moved_identity_is_relocated() {
    let ownership = StaticOwnership::owned_by(1);
    let scheduler = TestEnv::scheduler(1, ownership.clone());
    let relocator = Arc::new(RecordingRelocator::default());
    scheduler.set_relocator(relocator.clone());

    let body = Arc::new(CountingBody::new("moved"));
    let handle = scheduler
        .schedule(
            TaskBuilder::new()
                .with_identity("alice")
                .with_body(body.clone())
                .build(),
        )
        .unwrap();
    ownership.set("alice", IdentityLocation::Owned(NodeId(2)));
    scheduler.start();

    sleep(Duration::from_millis(100)).await;
    assert_eq!(body.runs(), 0);
    let relocated = relocator.relocated.lock().unwrap();
    assert_eq!(relocated.len(), 1);
    assert_eq!(relocated[0].0.id(), handle.id());
    assert_eq!(relocated[0].1, NodeId(2));
}

#[tokio::test(start_paused = true)]
async fn test_in_transit_identity_is_deferred() {
    let ownership = StaticOwnership::owned_by(1);
    let scheduler = TestEnv::scheduler(1, ownership.clone());
    let body = Arc::new(CountingBody::new("deferred"));
    scheduler
        .schedule(
            TaskBuilder::new()
                .with_identity("alice")
                .with_body(body.clone())
                .build(),
        )
        .unwrap();
    ownership.set(
        "alice",
        IdentityLocation::InTransit {
            from: NodeId(1),
            to: NodeId(1),
        },
    );
    scheduler.start();

    sleep(Duration::from_millis(250)).await;
    assert_eq!(body.runs(), 0);
    assert_eq!(scheduler.pending_count(), 1);

    ownership.set("alice", IdentityLocation::Owned(NodeId(1)));
    sleep(Duration::from_millis(200)).await;
    assert_eq!(body.runs(), 1);
}
