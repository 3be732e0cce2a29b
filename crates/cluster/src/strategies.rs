use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use scheduler_core::{CoordinatorConfig, NodeId, SchedulerError, SchedulerResult};
use tracing::debug;

/// 为身份选择归属节点的策略
pub trait NodeAssignPolicy: Send + Sync {
    fn name(&self) -> &str;

    /// 从存活节点中选择一个，没有可选节点时返回 `None`
    fn choose(&self, requesting: Option<NodeId>, live_nodes: &[NodeId]) -> Option<NodeId>;
}

/// 在存活节点间轮询
#[derive(Debug, Default)]
pub struct RoundRobinPolicy {
    counter: AtomicUsize,
}

impl RoundRobinPolicy {
    pub fn new() -> Self {
        Self {
            counter: AtomicUsize::new(0),
        }
    }
}

impl NodeAssignPolicy for RoundRobinPolicy {
    fn name(&self) -> &str {
        "round_robin"
    }

    fn choose(&self, _requesting: Option<NodeId>, live_nodes: &[NodeId]) -> Option<NodeId> {
        if live_nodes.is_empty() {
            debug!("没有可用的节点");
            return None;
        }
        let index = self.counter.fetch_add(1, Ordering::Relaxed) % live_nodes.len();
        let selected = live_nodes[index];

        debug!(
            "轮询策略选择节点: {} (索引: {}/{})",
            selected,
            index,
            live_nodes.len()
        );
        Some(selected)
    }
}

/// 优先把身份留在发起请求的节点上
///
/// 请求节点不存活或未知时退回轮询。
#[derive(Debug, Default)]
pub struct LocalNodePolicy {
    fallback: RoundRobinPolicy,
}

impl LocalNodePolicy {
    pub fn new() -> Self {
        Self::default()
    }
}

impl NodeAssignPolicy for LocalNodePolicy {
    fn name(&self) -> &str {
        "local"
    }

    fn choose(&self, requesting: Option<NodeId>, live_nodes: &[NodeId]) -> Option<NodeId> {
        match requesting {
            Some(node) if live_nodes.contains(&node) => Some(node),
            _ => self.fallback.choose(requesting, live_nodes),
        }
    }
}

pub fn policy_from_config(config: &CoordinatorConfig) -> SchedulerResult<Arc<dyn NodeAssignPolicy>> {
    match config.assign_policy.as_str() {
        "round_robin" => Ok(Arc::new(RoundRobinPolicy::new())),
        "local" => Ok(Arc::new(LocalNodePolicy::new())),
        other => Err(SchedulerError::Configuration(format!(
            "未知的节点分配策略: {other}"
        ))),
    }
}
