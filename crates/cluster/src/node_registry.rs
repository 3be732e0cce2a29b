use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use scheduler_core::{NodeId, SchedulerError, SchedulerResult};
use scheduler_infrastructure::StructuredLogger;
use tokio::sync::RwLock;
use tracing::info;

use crate::node::{NodeInfo, NodeStatus};

/// 集群节点及其存活状态
#[derive(Debug, Default)]
pub struct NodeRegistry {
    nodes: RwLock<BTreeMap<NodeId, NodeInfo>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册节点；已注册的节点重新上线并刷新心跳
    pub async fn register(&self, id: NodeId, name: &str) -> NodeInfo {
        let mut nodes = self.nodes.write().await;
        let node = nodes
            .entry(id)
            .or_insert_with(|| NodeInfo::new(id, name));
        let old_status = node.status;
        node.status = NodeStatus::Alive;
        node.last_heartbeat = Utc::now();
        if old_status != NodeStatus::Alive {
            StructuredLogger::log_node_state_change(
                id,
                &old_status.to_string(),
                &NodeStatus::Alive.to_string(),
            );
        }
        info!(node_id = %id, name, "节点已注册");
        node.clone()
    }

    pub async fn heartbeat(&self, id: NodeId) -> SchedulerResult<()> {
        let mut nodes = self.nodes.write().await;
        let node = nodes
            .get_mut(&id)
            .ok_or(SchedulerError::NodeNotFound { id })?;
        node.last_heartbeat = Utc::now();
        Ok(())
    }

    /// 设置节点状态，返回原状态
    pub async fn set_status(&self, id: NodeId, status: NodeStatus) -> SchedulerResult<NodeStatus> {
        let mut nodes = self.nodes.write().await;
        let node = nodes
            .get_mut(&id)
            .ok_or(SchedulerError::NodeNotFound { id })?;
        let old_status = node.status;
        if old_status != status {
            node.status = status;
            StructuredLogger::log_node_state_change(
                id,
                &old_status.to_string(),
                &status.to_string(),
            );
        }
        Ok(old_status)
    }

    pub async fn get(&self, id: NodeId) -> Option<NodeInfo> {
        self.nodes.read().await.get(&id).cloned()
    }

    pub async fn list(&self) -> Vec<NodeInfo> {
        self.nodes.read().await.values().cloned().collect()
    }

    pub async fn is_alive(&self, id: NodeId) -> bool {
        self.nodes
            .read()
            .await
            .get(&id)
            .is_some_and(NodeInfo::is_alive)
    }

    /// 存活节点，按ID排序
    pub async fn live_nodes(&self) -> Vec<NodeId> {
        self.nodes
            .read()
            .await
            .values()
            .filter(|node| node.is_alive())
            .map(|node| node.id)
            .collect()
    }

    /// 心跳超时的存活节点
    pub async fn expired_nodes(&self, now: DateTime<Utc>, timeout_seconds: i64) -> Vec<NodeId> {
        self.nodes
            .read()
            .await
            .values()
            .filter(|node| node.heartbeat_expired(now, timeout_seconds))
            .map(|node| node.id)
            .collect()
    }

    pub async fn remove(&self, id: NodeId) -> Option<NodeInfo> {
        self.nodes.write().await.remove(&id)
    }
}
