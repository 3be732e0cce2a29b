use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use scheduler_core::{
    IdentityId, IdentityLocation, IdentityOwnership, NodeId, SchedulerError, SchedulerResult,
};
use scheduler_infrastructure::{MetricsCollector, StructuredLogger};
use scheduler_transaction::TransactionCoordinator;
use tracing::{debug, info};

use crate::identity_map::{IdentityMap, IdentityMoveParticipant, MoveStart};
use crate::node_registry::NodeRegistry;
use crate::strategies::NodeAssignPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    Disabled,
    Enabled,
    Shutdown,
}

impl fmt::Display for CoordinatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoordinatorState::Disabled => f.write_str("DISABLED"),
            CoordinatorState::Enabled => f.write_str("ENABLED"),
            CoordinatorState::Shutdown => f.write_str("SHUTDOWN"),
        }
    }
}

/// 一次成功的身份迁移
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffloadResult {
    pub identity: IdentityId,
    pub from: NodeId,
    pub to: NodeId,
}

/// 身份到节点的分配与故障迁移
///
/// 迁移在事务中进行：身份先进入 in transit 状态，`IdentityMoveParticipant`
/// 提交后才落到新节点。`offload` 每次只迁移一个身份，重复调用是安全的。
/// 停用状态只暂停自动故障处理，分配和迁移仍然可用；关闭后所有操作都会失败。
pub struct GroupCoordinator {
    registry: Arc<NodeRegistry>,
    identities: Arc<IdentityMap>,
    transactions: Arc<TransactionCoordinator>,
    policy: Arc<dyn NodeAssignPolicy>,
    state: Mutex<CoordinatorState>,
    metrics: MetricsCollector,
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl GroupCoordinator {
    pub fn new(
        registry: Arc<NodeRegistry>,
        identities: Arc<IdentityMap>,
        transactions: Arc<TransactionCoordinator>,
        policy: Arc<dyn NodeAssignPolicy>,
    ) -> Self {
        Self {
            registry,
            identities,
            transactions,
            policy,
            state: Mutex::new(CoordinatorState::Disabled),
            metrics: MetricsCollector::new(),
        }
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    pub fn identities(&self) -> &Arc<IdentityMap> {
        &self.identities
    }

    pub fn state(&self) -> CoordinatorState {
        *lock_unpoisoned(&self.state)
    }

    pub fn is_enabled(&self) -> bool {
        self.state() == CoordinatorState::Enabled
    }

    pub fn start(&self) -> SchedulerResult<()> {
        self.transition(CoordinatorState::Enabled)
    }

    pub fn stop(&self) -> SchedulerResult<()> {
        self.transition(CoordinatorState::Disabled)
    }

    /// 关闭协调器，重复调用无效果
    pub fn shutdown(&self) {
        let mut state = lock_unpoisoned(&self.state);
        if *state != CoordinatorState::Shutdown {
            info!(policy = self.policy.name(), "节点协调器已关闭");
            *state = CoordinatorState::Shutdown;
        }
    }

    fn transition(&self, target: CoordinatorState) -> SchedulerResult<()> {
        let mut state = lock_unpoisoned(&self.state);
        if *state == CoordinatorState::Shutdown {
            return Err(self.shutdown_error());
        }
        let current = *state;
        if current != target {
            info!(from = %current, to = %target, "节点协调器状态变化");
            *state = target;
        }
        Ok(())
    }

    fn ensure_not_shutdown(&self) -> SchedulerResult<()> {
        if self.state() == CoordinatorState::Shutdown {
            Err(self.shutdown_error())
        } else {
            Ok(())
        }
    }

    fn shutdown_error(&self) -> SchedulerError {
        let error = SchedulerError::CoordinatorShutdown;
        StructuredLogger::log_invariant_violation("group_coordinator", &error.to_string());
        error
    }

    /// 按分配策略为身份选择存活节点
    pub async fn choose_node(
        &self,
        identity: &IdentityId,
        requesting: Option<NodeId>,
    ) -> SchedulerResult<NodeId> {
        self.ensure_not_shutdown()?;
        let live_nodes = self.registry.live_nodes().await;
        let node = self
            .policy
            .choose(requesting, &live_nodes)
            .ok_or(SchedulerError::NoNodesAvailable)?;
        debug!(identity = %identity, node = %node, policy = self.policy.name(), "为身份选择节点");
        Ok(node)
    }

    /// 返回身份的归属节点，未分配时按策略分配
    pub async fn assign_identity(
        &self,
        identity: &IdentityId,
        requesting: Option<NodeId>,
    ) -> SchedulerResult<NodeId> {
        self.ensure_not_shutdown()?;
        match self.identities.location(identity) {
            IdentityLocation::Owned(node) => return Ok(node),
            IdentityLocation::InTransit { .. } => {
                return Err(SchedulerError::IdentityInTransit {
                    identity: identity.to_string(),
                })
            }
            IdentityLocation::Unassigned => {}
        }

        let node = self.choose_node(identity, requesting).await?;
        match self.identities.assign(identity, node) {
            IdentityLocation::Owned(owner) => {
                if owner == node {
                    info!(identity = %identity, node = %node, "身份已分配到节点");
                }
                Ok(owner)
            }
            IdentityLocation::InTransit { .. } => Err(SchedulerError::IdentityInTransit {
                identity: identity.to_string(),
            }),
            IdentityLocation::Unassigned => Err(SchedulerError::invariant(format!(
                "身份 {identity} 分配后仍未分配"
            ))),
        }
    }

    /// 删除永久不再活跃的身份
    pub fn remove_identity(&self, identity: &IdentityId) -> Option<NodeId> {
        let removed = self.identities.remove(identity);
        if let Some(node) = removed {
            debug!(identity = %identity, node = %node, "身份已删除");
        }
        removed
    }

    /// 把节点上的一个身份迁到新选择的节点
    ///
    /// 节点上已没有身份，或者策略仍然选中了原节点时返回 `Ok(None)`。
    /// 没有存活节点时返回 `NoNodesAvailable`，由调用方稍后重试。
    pub async fn offload(&self, node: NodeId) -> SchedulerResult<Option<OffloadResult>> {
        self.ensure_not_shutdown()?;
        let Some(identity) = self.identities.find_on_node(node) else {
            debug!(node = %node, "节点上没有需要迁移的身份");
            return Ok(None);
        };
        self.offload_identity(&identity, node).await
    }

    /// 把身份从 `from` 迁走；身份已不在 `from` 上时什么也不做
    pub async fn offload_identity(
        &self,
        identity: &IdentityId,
        from: NodeId,
    ) -> SchedulerResult<Option<OffloadResult>> {
        self.ensure_not_shutdown()?;
        if self.identities.location(identity) != IdentityLocation::Owned(from) {
            debug!(identity = %identity, node = %from, "身份已不在该节点上，跳过迁移");
            return Ok(None);
        }

        let to = match self.choose_node(identity, None).await {
            Ok(to) => to,
            Err(error) => {
                self.metrics.record_offload(false);
                StructuredLogger::log_offload_failed(from, Some(identity), &error.to_string());
                return Err(error);
            }
        };
        // 情况可能已经好转
        if to == from {
            return Ok(None);
        }

        if self.identities.begin_move(identity, from, to)? == MoveStart::AlreadyMoved {
            return Ok(None);
        }

        let mut txn = self.transactions.begin("identity_move", None);
        let participant =
            IdentityMoveParticipant::new(self.identities.clone(), identity.clone(), from, to);
        if let Err(error) = txn.join(Arc::new(participant)) {
            self.identities.revert_move(identity);
            return Err(error);
        }

        match txn
            .prepare_and_commit()
            .await
            .and_then(|()| self.confirm_moved(identity, from, to))
        {
            Ok(result) => {
                self.metrics.record_offload(true);
                StructuredLogger::log_identity_relocated(identity, from, to);
                Ok(Some(result))
            }
            Err(error) => {
                self.metrics.record_offload(false);
                StructuredLogger::log_offload_failed(from, Some(identity), &error.to_string());
                Err(error)
            }
        }
    }

    /// 提交阶段的失败只会被记录，这里以映射的实际状态为准
    fn confirm_moved(
        &self,
        identity: &IdentityId,
        from: NodeId,
        to: NodeId,
    ) -> SchedulerResult<OffloadResult> {
        match self.identities.location(identity) {
            IdentityLocation::Owned(owner) if owner == to => Ok(OffloadResult {
                identity: identity.clone(),
                from,
                to,
            }),
            location => Err(SchedulerError::Internal(format!(
                "身份 {identity} 未能迁往 {to}，当前位置: {location:?}"
            ))),
        }
    }

    /// 反复调用 `offload` 直到节点上没有身份
    pub async fn offload_all(&self, node: NodeId) -> SchedulerResult<Vec<OffloadResult>> {
        let mut moved = Vec::new();
        while let Some(result) = self.offload(node).await? {
            moved.push(result);
        }
        if !moved.is_empty() {
            info!(node = %node, count = moved.len(), "节点上的身份已全部迁移");
        }
        Ok(moved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeStatus;
    use crate::strategies::RoundRobinPolicy;
    use scheduler_core::TransactionConfig;
    use std::time::Duration;

    async fn coordinator(nodes: &[u64]) -> GroupCoordinator {
        let registry = Arc::new(NodeRegistry::new());
        for node in nodes {
            registry
                .register(NodeId(*node), &format!("node-{node}"))
                .await;
        }
        GroupCoordinator::new(
            registry,
            Arc::new(IdentityMap::new(4, Duration::from_secs(5))),
            Arc::new(TransactionCoordinator::new(&TransactionConfig::default())),
            Arc::new(RoundRobinPolicy::new()),
        )
    }

    #[tokio::test]
    async fn test_lifecycle_states() {
        let coordinator = coordinator(&[1]).await;
        assert_eq!(coordinator.state(), CoordinatorState::Disabled);
        coordinator.start().unwrap();
        assert!(coordinator.is_enabled());
        coordinator.stop().unwrap();
        assert_eq!(coordinator.state(), CoordinatorState::Disabled);

        coordinator.shutdown();
        coordinator.shutdown();
        assert_eq!(coordinator.state(), CoordinatorState::Shutdown);
        assert_eq!(
            coordinator.start().unwrap_err(),
            SchedulerError::CoordinatorShutdown
        );
        let err = coordinator.offload(NodeId(1)).await.unwrap_err();
        assert!(err.is_invariant_violation());
    }

    #[tokio::test]
    async fn test_assign_identity_is_stable() {
        let coordinator = coordinator(&[1, 2]).await;
        let alice = IdentityId::from("alice");
        let bob = IdentityId::from("bob");

        let first = coordinator.assign_identity(&alice, None).await.unwrap();
        assert_eq!(coordinator.assign_identity(&alice, None).await.unwrap(), first);
        let second = coordinator.assign_identity(&bob, None).await.unwrap();
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn test_assign_without_nodes() {
        let coordinator = coordinator(&[]).await;
        assert_eq!(
            coordinator
                .assign_identity(&IdentityId::from("alice"), None)
                .await
                .unwrap_err(),
            SchedulerError::NoNodesAvailable
        );
    }

    #[tokio::test]
    async fn test_offload_moves_one_identity_per_call() {
        let coordinator = coordinator(&[1, 2]).await;
        for name in ["alice", "bob"] {
            coordinator.identities().assign(&IdentityId::from(name), NodeId(1));
        }
        coordinator
            .registry()
            .set_status(NodeId(1), NodeStatus::Down)
            .await
            .unwrap();

        let moved = coordinator.offload(NodeId(1)).await.unwrap().unwrap();
        assert_eq!(moved.from, NodeId(1));
        assert_eq!(moved.to, NodeId(2));
        assert_eq!(coordinator.identities().identities_on(NodeId(1)).len(), 1);

        let rest = coordinator.offload_all(NodeId(1)).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert!(coordinator.identities().identities_on(NodeId(1)).is_empty());
        assert_eq!(coordinator.offload(NodeId(1)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_move_reverted_before_commit_is_not_reported() {
        let coordinator = coordinator(&[1, 2]).await;
        let alice = IdentityId::from("alice");
        coordinator.identities().assign(&alice, NodeId(1));

        // 窗口在提交前被回滚，身份仍在原节点
        coordinator
            .identities()
            .begin_move(&alice, NodeId(1), NodeId(2))
            .unwrap();
        coordinator.identities().revert_move(&alice);
        let err = coordinator
            .confirm_moved(&alice, NodeId(1), NodeId(2))
            .unwrap_err();
        assert!(matches!(err, SchedulerError::Internal(_)));

        coordinator
            .identities()
            .begin_move(&alice, NodeId(1), NodeId(2))
            .unwrap();
        coordinator.identities().complete_move(&alice, NodeId(2)).unwrap();
        let result = coordinator
            .confirm_moved(&alice, NodeId(1), NodeId(2))
            .unwrap();
        assert_eq!(result.to, NodeId(2));
    }

    #[tokio::test]
    async fn test_remove_identity() {
        let coordinator = coordinator(&[1]).await;
        let alice = IdentityId::from("alice");
        coordinator.assign_identity(&alice, None).await.unwrap();
        assert_eq!(coordinator.remove_identity(&alice), Some(NodeId(1)));
        assert_eq!(coordinator.remove_identity(&alice), None);
    }
}
