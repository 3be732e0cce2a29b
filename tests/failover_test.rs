use std::sync::Arc;
use std::time::Duration;

use scheduler::{Application, ShutdownManager};
use scheduler_cluster::{NodeEvent, NodeStatus};
use scheduler_core::{AppConfig, IdentityId, IdentityLocation, IdentityOwnership, NodeId};
use scheduler_dispatcher::NewTask;
use scheduler_testing_utils::{CountingBody, TestEnv};
use tokio::task::JoinHandle;

fn config() -> AppConfig {
    let mut config = AppConfig::default();
    config.node.node_id = 1;
    config.node.local_nodes = 2;
    config.scheduler.worker_threads = 2;
    config.scheduler.relocation_retry_delay_ms = 10;
    config.scheduler.shutdown_timeout_seconds = 5;
    config
}

async fn start(config: AppConfig) -> (Arc<Application>, ShutdownManager, JoinHandle<()>) {
    let app = Arc::new(Application::new(config).await.unwrap());
    let shutdown = ShutdownManager::new();
    let rx = shutdown.subscribe().await;
    let runner = {
        let app = Arc::clone(&app);
        tokio::spawn(async move { app.run(rx).await.unwrap() })
    };
    let started = TestEnv::wait_for(
        || app.cluster().coordinator().is_enabled(),
        Duration::from_secs(5),
    )
    .await;
    assert!(started, "application did not start");
    (app, shutdown, runner)
}

async fn stop(shutdown: ShutdownManager, runner: JoinHandle<()>) {
    shutdown.shutdown().await;
    tokio::time::timeout(Duration::from_secs(10), runner)
        .await
        .expect("application should stop")
        .unwrap();
}

#[tokio::test]
async fn test_tasks_of_downed_node_run_on_new_owner() {
    let (app, shutdown, runner) = start(config()).await;
    let cluster = Arc::clone(app.cluster());
    let body = Arc::new(CountingBody::new("report"));

    let handle = cluster
        .schedule_delayed(
            NewTask::new(body.clone(), "alice"),
            None,
            Duration::from_millis(300),
        )
        .await
        .unwrap();
    let owner = handle.id().node;
    let survivor = if owner == NodeId(1) { NodeId(2) } else { NodeId(1) };
    assert_eq!(cluster.scheduler(owner).unwrap().pending_count(), 1);

    app.node_events().send(NodeEvent::Down(owner)).await.unwrap();

    let identities = cluster.coordinator().identities().clone();
    let moved = TestEnv::wait_for(
        || identities.location(&IdentityId::from("alice")) == IdentityLocation::Owned(survivor),
        Duration::from_secs(5),
    )
    .await;
    assert!(moved, "identity was not offloaded");

    let ran = TestEnv::wait_for(|| body.runs() == 1, Duration::from_secs(5)).await;
    assert!(ran, "task did not run after failover");
    assert_eq!(cluster.scheduler(owner).unwrap().pending_count(), 0);

    stop(shutdown, runner).await;
}

#[tokio::test]
async fn test_recurring_task_follows_moved_identity() {
    let (app, shutdown, runner) = start(config()).await;
    let cluster = Arc::clone(app.cluster());
    let coordinator = Arc::clone(cluster.coordinator());
    let bob = IdentityId::from("bob");
    coordinator.identities().assign(&bob, NodeId(1));

    let body = Arc::new(CountingBody::new("sync"));
    cluster
        .schedule_recurring(
            NewTask::new(body.clone(), "bob"),
            None,
            Duration::from_millis(20),
            Duration::from_millis(50),
        )
        .await
        .unwrap();
    assert!(TestEnv::wait_for(|| body.runs() >= 1, Duration::from_secs(5)).await);

    // 排空节点1，身份只能迁往节点2
    coordinator
        .registry()
        .set_status(NodeId(1), NodeStatus::Draining)
        .await
        .unwrap();
    let result = coordinator
        .offload_identity(&bob, NodeId(1))
        .await
        .unwrap()
        .expect("identity should move");
    assert_eq!(result.to, NodeId(2));

    let runs_before = body.runs();
    let followed = TestEnv::wait_for(
        || {
            body.runs() >= runs_before + 2
                && cluster.scheduler(NodeId(1)).unwrap().pending_count() == 0
                && cluster.scheduler(NodeId(2)).unwrap().pending_count() == 1
        },
        Duration::from_secs(5),
    )
    .await;
    assert!(followed, "recurring task did not move to the new owner");

    stop(shutdown, runner).await;
}

#[tokio::test]
async fn test_submit_after_shutdown_is_rejected() {
    let (app, shutdown, runner) = start(config()).await;
    let cluster = Arc::clone(app.cluster());
    stop(shutdown, runner).await;

    let body = Arc::new(CountingBody::new("late"));
    assert!(cluster
        .schedule(NewTask::new(body, "carol"), None)
        .await
        .is_err());
}
