use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result};
use scheduler_cluster::{
    FailureDetectorConfig, GroupCoordinator, IdentityMap, NodeEvent, NodeFailureHandler,
    NodeRegistry,
};
use scheduler_core::{AppConfig, NodeId};
use scheduler_dispatcher::TaskScheduler;
use scheduler_transaction::TransactionCoordinator;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::cluster::LocalCluster;
use crate::shutdown::ShutdownManager;

const NODE_EVENT_BUFFER: usize = 64;

/// 主应用程序
///
/// 在一个进程内托管 `node.local_nodes` 个节点，节点ID从 `node.node_id` 开始连续编号。
/// 所有节点共享锁表、身份映射和节点注册表。
pub struct Application {
    config: AppConfig,
    cluster: Arc<LocalCluster>,
    failure_handler: Arc<NodeFailureHandler>,
    node_events: mpsc::Sender<NodeEvent>,
    node_events_rx: Mutex<Option<mpsc::Receiver<NodeEvent>>>,
}

impl Application {
    pub async fn new(config: AppConfig) -> Result<Self> {
        info!(
            node_id = config.node.node_id,
            local_nodes = config.node.local_nodes,
            "初始化应用程序"
        );

        let transactions = Arc::new(TransactionCoordinator::new(&config.transaction));
        let identities = Arc::new(IdentityMap::new(
            config.coordinator.identity_shards,
            config.coordinator.move_expire(),
        ));
        let registry = Arc::new(NodeRegistry::new());
        let assign_policy = scheduler_cluster::policy_from_config(&config.coordinator)
            .context("创建节点分配策略失败")?;
        let retry_policy =
            scheduler_dispatcher::policy_from_config(&config.scheduler, &config.retry)
                .context("创建重试策略失败")?;

        let mut schedulers = Vec::with_capacity(config.node.local_nodes);
        for node in local_node_ids(&config) {
            registry
                .register(node, &format!("{}-{}", config.node.name, node.0))
                .await;
            schedulers.push(TaskScheduler::new(
                node,
                &config.scheduler,
                Arc::clone(&transactions),
                identities.clone(),
                Arc::clone(&retry_policy),
            ));
        }

        let coordinator = Arc::new(GroupCoordinator::new(
            registry,
            identities,
            transactions,
            assign_policy,
        ));
        let cluster = LocalCluster::new(Arc::clone(&coordinator), schedulers);

        let mut failure_handler =
            NodeFailureHandler::new(coordinator, FailureDetectorConfig::from(&config.coordinator));
        failure_handler.add_listener(cluster.clone());

        let (node_events, node_events_rx) = mpsc::channel(NODE_EVENT_BUFFER);

        Ok(Self {
            config,
            cluster,
            failure_handler: Arc::new(failure_handler),
            node_events,
            node_events_rx: Mutex::new(Some(node_events_rx)),
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn cluster(&self) -> &Arc<LocalCluster> {
        &self.cluster
    }

    /// 外部看门狗用来送达节点事件的通道
    pub fn node_events(&self) -> mpsc::Sender<NodeEvent> {
        self.node_events.clone()
    }

    /// 运行直到收到关闭信号，然后等待在途事务结束
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        let events_rx = self
            .node_events_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .context("应用程序已经运行过")?;

        self.cluster
            .coordinator()
            .start()
            .context("启动节点协调器失败")?;
        self.cluster.start();

        let detector_handle = tokio::spawn(
            Arc::clone(&self.failure_handler).run(events_rx, shutdown_rx.resubscribe()),
        );
        let heartbeat_handle = tokio::spawn(run_heartbeat_loop(
            self.cluster.node_ids(),
            self.node_events.clone(),
            self.config.coordinator.detection_interval(),
            shutdown_rx.resubscribe(),
        ));

        info!(nodes = ?self.cluster.node_ids(), "应用程序已启动");

        let _ = shutdown_rx.recv().await;
        info!("应用程序收到关闭信号");

        let timeout = self.config.scheduler.shutdown_timeout();
        if !self.cluster.shutdown(timeout).await {
            warn!(timeout_secs = timeout.as_secs(), "部分在途事务未在超时内结束");
        }

        for (name, handle) in [("failure_detector", detector_handle), ("heartbeat", heartbeat_handle)] {
            let finished = ShutdownManager::wait_step(name, timeout, async {
                if let Err(e) = handle.await {
                    error!(component = name, error = %e, "后台任务异常退出");
                }
            })
            .await;
            debug!(component = name, finished, "后台任务已停止");
        }

        info!("应用程序已停止");
        Ok(())
    }
}

fn local_node_ids(config: &AppConfig) -> impl Iterator<Item = NodeId> {
    let first = config.node.node_id;
    (0..config.node.local_nodes as u64).map(move |offset| NodeId(first + offset))
}

/// 本地节点的心跳循环
async fn run_heartbeat_loop(
    nodes: Vec<NodeId>,
    events: mpsc::Sender<NodeEvent>,
    interval: std::time::Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                debug!("心跳循环收到关闭信号");
                break;
            }
            _ = ticker.tick() => {
                for node in &nodes {
                    if let Err(e) = events.try_send(NodeEvent::Heartbeat(*node)) {
                        warn!(node = %node, error = %e, "发送节点心跳失败");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(local_nodes: usize) -> AppConfig {
        let mut config = AppConfig::default();
        config.node.node_id = 10;
        config.node.local_nodes = local_nodes;
        config.scheduler.worker_threads = 2;
        config
    }

    #[test]
    fn test_local_node_ids_are_consecutive() {
        let ids: Vec<_> = local_node_ids(&config(3)).collect();
        assert_eq!(ids, vec![NodeId(10), NodeId(11), NodeId(12)]);
    }

    #[tokio::test]
    async fn test_new_registers_local_nodes() {
        let app = Application::new(config(2)).await.unwrap();
        assert_eq!(app.cluster().node_ids(), vec![NodeId(10), NodeId(11)]);
        let live = app.cluster().coordinator().registry().live_nodes().await;
        assert_eq!(live, vec![NodeId(10), NodeId(11)]);
    }

    #[tokio::test]
    async fn test_unknown_policy_rejected() {
        let mut config = config(1);
        config.coordinator.assign_policy = "random".to_string();
        assert!(Application::new(config).await.is_err());
    }

    #[tokio::test]
    async fn test_run_twice_fails() {
        let app = Arc::new(Application::new(config(1)).await.unwrap());
        let shutdown = ShutdownManager::new();

        let runner = {
            let app = Arc::clone(&app);
            let rx = shutdown.subscribe().await;
            tokio::spawn(async move { app.run(rx).await })
        };
        tokio::task::yield_now().await;
        shutdown.shutdown().await;
        runner.await.unwrap().unwrap();

        let rx = shutdown.subscribe().await;
        assert!(app.run(rx).await.is_err());
    }
}
