use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use scheduler_core::{CoordinatorConfig, NodeId, SchedulerError, SchedulerResult};
use scheduler_infrastructure::StructuredLogger;
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, error, info, warn};

use crate::group_coordinator::{GroupCoordinator, OffloadResult};
use crate::node::{NodeEvent, NodeStatus};

/// 节点失效检测配置
#[derive(Debug, Clone)]
pub struct FailureDetectorConfig {
    /// 心跳超时时间（秒）
    pub heartbeat_timeout_seconds: i64,
    /// 检测间隔
    pub detection_interval: Duration,
}

impl Default for FailureDetectorConfig {
    fn default() -> Self {
        Self::from(&CoordinatorConfig::default())
    }
}

impl From<&CoordinatorConfig> for FailureDetectorConfig {
    fn from(config: &CoordinatorConfig) -> Self {
        Self {
            heartbeat_timeout_seconds: config.heartbeat_timeout_seconds,
            detection_interval: config.detection_interval(),
        }
    }
}

/// 节点上的身份迁移完成后收到通知
#[async_trait]
pub trait NodeListener: Send + Sync {
    async fn node_offloaded(&self, node: NodeId, moved: &[OffloadResult]);
}

/// 处理节点失效和排空
///
/// 消费外部看门狗送来的 `NodeEvent`，并周期性地把心跳超时的节点标记为下线。
/// 下线或排空的节点上的身份通过 `GroupCoordinator::offload` 逐个迁走；
/// 遇到没有可用节点时记下该节点，在下一次检测时重试。
pub struct NodeFailureHandler {
    coordinator: Arc<GroupCoordinator>,
    config: FailureDetectorConfig,
    pending_offloads: Mutex<BTreeSet<NodeId>>,
    listeners: Vec<Arc<dyn NodeListener>>,
}

impl NodeFailureHandler {
    pub fn new(coordinator: Arc<GroupCoordinator>, config: FailureDetectorConfig) -> Self {
        Self {
            coordinator,
            config,
            pending_offloads: Mutex::new(BTreeSet::new()),
            listeners: Vec::new(),
        }
    }

    pub fn add_listener(&mut self, listener: Arc<dyn NodeListener>) {
        self.listeners.push(listener);
    }

    pub async fn pending_offloads(&self) -> Vec<NodeId> {
        self.pending_offloads.lock().await.iter().copied().collect()
    }

    /// 处理一个节点事件
    pub async fn handle_event(&self, event: NodeEvent) -> SchedulerResult<()> {
        let registry = self.coordinator.registry();
        match event {
            NodeEvent::Up { id, name } => {
                registry.register(id, &name).await;
                // 新节点上线后之前失败的迁移可能可以继续
                self.retry_pending_offloads().await;
            }
            NodeEvent::Heartbeat(id) => registry.heartbeat(id).await?,
            NodeEvent::Down(id) => {
                registry.set_status(id, NodeStatus::Down).await?;
                self.handle_failed_node(id).await?;
            }
            NodeEvent::Drain(id) => {
                registry.set_status(id, NodeStatus::Draining).await?;
                self.handle_failed_node(id).await?;
            }
        }
        Ok(())
    }

    /// 把心跳超时的存活节点标记为下线
    pub async fn detect_failed_nodes(&self) -> Vec<NodeId> {
        let registry = self.coordinator.registry();
        let expired = registry
            .expired_nodes(Utc::now(), self.config.heartbeat_timeout_seconds)
            .await;

        let mut failed = Vec::with_capacity(expired.len());
        for node in expired {
            warn!(node = %node, "检测到心跳超时的节点");
            match registry.set_status(node, NodeStatus::Down).await {
                Ok(_) => failed.push(node),
                Err(e) => error!(node = %node, error = %e, "标记失效节点时出错"),
            }
        }
        failed
    }

    /// 迁走失效节点上的全部身份
    ///
    /// 没有可用节点时返回 `Ok(0)` 并记下节点，等待重试。
    pub async fn handle_failed_node(&self, node: NodeId) -> SchedulerResult<usize> {
        info!(node = %node, "开始迁移失效节点上的身份");
        match self.coordinator.offload_all(node).await {
            Ok(moved) => {
                self.pending_offloads.lock().await.remove(&node);
                for listener in &self.listeners {
                    listener.node_offloaded(node, &moved).await;
                }
                Ok(moved.len())
            }
            Err(SchedulerError::NoNodesAvailable) => {
                warn!(node = %node, "没有可用节点接收身份，稍后重试");
                self.pending_offloads.lock().await.insert(node);
                Ok(0)
            }
            Err(e) => {
                StructuredLogger::log_offload_failed(node, None, &e.to_string());
                self.pending_offloads.lock().await.insert(node);
                Err(e)
            }
        }
    }

    /// 重试之前没有完成的迁移
    pub async fn retry_pending_offloads(&self) {
        let pending = self.pending_offloads().await;
        for node in pending {
            debug!(node = %node, "重试节点迁移");
            if let Err(e) = self.handle_failed_node(node).await {
                error!(node = %node, error = %e, "重试节点迁移失败");
            }
        }
    }

    /// 执行一次检测
    pub async fn tick(&self) {
        if !self.coordinator.is_enabled() {
            debug!("节点协调器未启用，跳过失效检测");
            return;
        }
        for node in self.detect_failed_nodes().await {
            if let Err(e) = self.handle_failed_node(node).await {
                error!(node = %node, error = %e, "处理失效节点时出错");
            }
        }
        self.retry_pending_offloads().await;
    }

    /// 事件与检测循环，收到关闭信号或事件通道关闭后退出
    pub async fn run(
        self: Arc<Self>,
        mut events: mpsc::Receiver<NodeEvent>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        info!(
            interval_secs = self.config.detection_interval.as_secs(),
            heartbeat_timeout_secs = self.config.heartbeat_timeout_seconds,
            "启动节点失效检测循环"
        );
        let mut interval = tokio::time::interval(self.config.detection_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("收到停止信号，退出节点失效检测循环");
                    break;
                }
                event = events.recv() => {
                    let Some(event) = event else {
                        info!("节点事件通道已关闭，退出节点失效检测循环");
                        break;
                    };
                    if !self.coordinator.is_enabled() {
                        debug!(?event, "节点协调器未启用，忽略节点事件");
                        continue;
                    }
                    if let Err(e) = self.handle_event(event).await {
                        error!(error = %e, "处理节点事件时出错");
                    }
                }
                _ = interval.tick() => self.tick().await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity_map::IdentityMap;
    use crate::node_registry::NodeRegistry;
    use crate::strategies::RoundRobinPolicy;
    use scheduler_core::{IdentityId, IdentityLocation, IdentityOwnership, TransactionConfig};
    use scheduler_transaction::TransactionCoordinator;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingListener {
        offloaded: StdMutex<Vec<(NodeId, usize)>>,
    }

    #[async_trait]
    impl NodeListener for RecordingListener {
        async fn node_offloaded(&self, node: NodeId, moved: &[OffloadResult]) {
            self.offloaded.lock().unwrap().push((node, moved.len()));
        }
    }

    async fn coordinator(nodes: &[u64]) -> Arc<GroupCoordinator> {
        let registry = Arc::new(NodeRegistry::new());
        for node in nodes {
            registry
                .register(NodeId(*node), &format!("node-{node}"))
                .await;
        }
        let coordinator = GroupCoordinator::new(
            registry,
            Arc::new(IdentityMap::new(4, Duration::from_secs(5))),
            Arc::new(TransactionCoordinator::new(&TransactionConfig::default())),
            Arc::new(RoundRobinPolicy::new()),
        );
        coordinator.start().unwrap();
        Arc::new(coordinator)
    }

    #[tokio::test]
    async fn test_down_event_offloads_node() {
        let coordinator = coordinator(&[1, 2]).await;
        let alice = IdentityId::from("alice");
        coordinator.identities().assign(&alice, NodeId(1));

        let listener = Arc::new(RecordingListener::default());
        let mut handler = NodeFailureHandler::new(coordinator.clone(), FailureDetectorConfig::default());
        handler.add_listener(listener.clone());

        handler.handle_event(NodeEvent::Down(NodeId(1))).await.unwrap();
        assert_eq!(
            coordinator.identities().location(&alice),
            IdentityLocation::Owned(NodeId(2))
        );
        assert_eq!(*listener.offloaded.lock().unwrap(), vec![(NodeId(1), 1)]);

        // 看门狗重复送达同一事件
        handler.handle_event(NodeEvent::Down(NodeId(1))).await.unwrap();
        assert_eq!(
            coordinator.identities().location(&alice),
            IdentityLocation::Owned(NodeId(2))
        );
    }

    #[tokio::test]
    async fn test_offload_retried_when_node_comes_up() {
        let coordinator = coordinator(&[1]).await;
        let alice = IdentityId::from("alice");
        coordinator.identities().assign(&alice, NodeId(1));
        let handler = NodeFailureHandler::new(coordinator.clone(), FailureDetectorConfig::default());

        handler.handle_event(NodeEvent::Down(NodeId(1))).await.unwrap();
        assert_eq!(handler.pending_offloads().await, vec![NodeId(1)]);
        assert_eq!(
            coordinator.identities().location(&alice),
            IdentityLocation::Owned(NodeId(1))
        );

        handler
            .handle_event(NodeEvent::Up {
                id: NodeId(3),
                name: "node-3".to_string(),
            })
            .await
            .unwrap();
        assert!(handler.pending_offloads().await.is_empty());
        assert_eq!(
            coordinator.identities().location(&alice),
            IdentityLocation::Owned(NodeId(3))
        );
    }

    #[tokio::test]
    async fn test_heartbeat_for_unknown_node() {
        let coordinator = coordinator(&[1]).await;
        let handler = NodeFailureHandler::new(coordinator, FailureDetectorConfig::default());
        assert!(handler
            .handle_event(NodeEvent::Heartbeat(NodeId(7)))
            .await
            .is_err());
        handler.handle_event(NodeEvent::Heartbeat(NodeId(1))).await.unwrap();
    }

    #[tokio::test]
    async fn test_expired_heartbeat_marks_node_down() {
        let coordinator = coordinator(&[1, 2]).await;
        coordinator
            .identities()
            .assign(&IdentityId::from("alice"), NodeId(1));
        let handler = NodeFailureHandler::new(
            coordinator.clone(),
            FailureDetectorConfig {
                heartbeat_timeout_seconds: -1,
                detection_interval: Duration::from_secs(1),
            },
        );

        // 超时为负数时所有存活节点都视为超时
        handler.tick().await;
        assert!(coordinator.registry().live_nodes().await.is_empty());
        assert_eq!(handler.pending_offloads().await, vec![NodeId(1)]);
    }
}
