use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use scheduler_cluster::{GroupCoordinator, NodeListener, OffloadResult};
use scheduler_core::{
    IdentityLocation, IdentityOwnership, NodeId, SchedulerError, SchedulerResult,
};
use scheduler_dispatcher::{NewTask, ScheduledTask, TaskHandle, TaskRelocator, TaskScheduler};
use tracing::{debug, info, warn};

/// 进程内多节点的任务路由
///
/// 每个本地节点有自己的 `TaskScheduler`，所有调度器共享同一个身份映射。
/// 新任务先通过协调器确定身份的归属节点，再提交到该节点的调度器；
/// 调度器发现身份已迁走时通过这里把任务转交给新节点。
pub struct LocalCluster {
    coordinator: Arc<GroupCoordinator>,
    schedulers: BTreeMap<NodeId, TaskScheduler>,
}

/// 调度器持有的转交器，只保留对集群的弱引用
struct ClusterRelocator {
    cluster: Weak<LocalCluster>,
}

#[async_trait]
impl TaskRelocator for ClusterRelocator {
    async fn relocate(&self, task: ScheduledTask, new_owner: NodeId) -> SchedulerResult<()> {
        let cluster = self
            .cluster
            .upgrade()
            .ok_or(SchedulerError::CoordinatorShutdown)?;
        cluster.scheduler_for(new_owner)?.adopt(task)
    }
}

/// 提交方式
#[derive(Debug, Clone, Copy)]
enum Submission {
    Now,
    Delayed(Duration),
    Recurring { initial_delay: Duration, period: Duration },
}

impl LocalCluster {
    pub fn new(coordinator: Arc<GroupCoordinator>, schedulers: Vec<TaskScheduler>) -> Arc<Self> {
        let cluster = Arc::new(Self {
            coordinator,
            schedulers: schedulers
                .into_iter()
                .map(|scheduler| (scheduler.node_id(), scheduler))
                .collect(),
        });
        for scheduler in cluster.schedulers.values() {
            scheduler.set_relocator(Arc::new(ClusterRelocator {
                cluster: Arc::downgrade(&cluster),
            }));
        }
        cluster
    }

    pub fn coordinator(&self) -> &Arc<GroupCoordinator> {
        &self.coordinator
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.schedulers.keys().copied().collect()
    }

    pub fn scheduler(&self, node: NodeId) -> Option<&TaskScheduler> {
        self.schedulers.get(&node)
    }

    fn scheduler_for(&self, node: NodeId) -> SchedulerResult<&TaskScheduler> {
        self.schedulers
            .get(&node)
            .ok_or(SchedulerError::NodeNotFound { id: node })
    }

    /// 启动所有本地调度器
    pub fn start(&self) {
        for scheduler in self.schedulers.values() {
            scheduler.start();
        }
    }

    /// 把任务提交到身份的归属节点，身份未分配时先分配
    ///
    /// `requesting` 是发起提交的节点，`local` 分配策略会优先选择它。
    pub async fn schedule(
        &self,
        task: NewTask,
        requesting: Option<NodeId>,
    ) -> SchedulerResult<TaskHandle> {
        self.submit(task, requesting, Submission::Now).await
    }

    pub async fn schedule_delayed(
        &self,
        task: NewTask,
        requesting: Option<NodeId>,
        delay: Duration,
    ) -> SchedulerResult<TaskHandle> {
        self.submit(task, requesting, Submission::Delayed(delay)).await
    }

    pub async fn schedule_recurring(
        &self,
        task: NewTask,
        requesting: Option<NodeId>,
        initial_delay: Duration,
        period: Duration,
    ) -> SchedulerResult<TaskHandle> {
        let submission = Submission::Recurring {
            initial_delay,
            period,
        };
        self.submit(task, requesting, submission).await
    }

    async fn submit(
        &self,
        task: NewTask,
        requesting: Option<NodeId>,
        submission: Submission,
    ) -> SchedulerResult<TaskHandle> {
        let mut owner = self
            .coordinator
            .assign_identity(&task.identity, requesting)
            .await?;
        // 分配和提交之间身份可能刚好被迁走，跟随新的归属节点重试一次
        for attempt in 0..2 {
            let scheduler = self.scheduler_for(owner)?;
            let result = match submission {
                Submission::Now => scheduler.schedule(task.clone()),
                Submission::Delayed(delay) => scheduler.schedule_delayed(task.clone(), delay),
                Submission::Recurring {
                    initial_delay,
                    period,
                } => scheduler.schedule_recurring(task.clone(), initial_delay, period),
            };
            match result {
                Err(SchedulerError::IdentityNotOwned {
                    owner: Some(new_owner),
                    ..
                }) if attempt == 0 => {
                    debug!(identity = %task.identity, from = %owner, to = %new_owner, "身份归属已变化，重新提交");
                    owner = new_owner;
                }
                other => return other,
            }
        }
        Err(SchedulerError::IdentityNotOwned {
            identity: task.identity.to_string(),
            owner: Some(owner),
        })
    }

    /// 把节点队列中的任务转交给各自身份的当前归属节点
    ///
    /// 归属节点不在本进程或身份仍在迁移中的任务放回原节点，运行前会再次检查归属。
    pub fn rehome_pending(&self, node: NodeId) -> usize {
        let Some(source) = self.schedulers.get(&node) else {
            return 0;
        };
        let identities = self.coordinator.identities();
        let mut moved = 0;
        for task in source.drain_pending() {
            let target = match identities.location(task.identity()) {
                IdentityLocation::Owned(owner) if owner != node => self.schedulers.get(&owner),
                _ => None,
            };
            let target = target.unwrap_or(source);
            let task_id = task.id();
            let target_node = target.node_id();
            match target.adopt(task) {
                Ok(()) if target_node != node => moved += 1,
                Ok(()) => {}
                Err(e) => warn!(task_id = %task_id, node = %target_node, error = %e, "转交任务失败"),
            }
        }
        if moved > 0 {
            info!(node = %node, moved, "已转交失效节点队列中的任务");
        }
        moved
    }

    /// 关闭所有本地调度器和协调器，全部在超时内结束时返回 `true`
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        self.coordinator.shutdown();
        let results = join_all(
            self.schedulers
                .values()
                .map(|scheduler| scheduler.shutdown(timeout)),
        )
        .await;
        results.into_iter().all(|drained| drained)
    }
}

#[async_trait]
impl NodeListener for LocalCluster {
    async fn node_offloaded(&self, node: NodeId, moved: &[OffloadResult]) {
        debug!(node = %node, identities = moved.len(), "节点身份迁移完成，转交队列中的任务");
        self.rehome_pending(node);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scheduler_cluster::{IdentityMap, NodeRegistry, RoundRobinPolicy};
    use scheduler_core::{IdentityId, SchedulerConfig, TransactionConfig};
    use scheduler_dispatcher::ImmediateRetryPolicy;
    use scheduler_testing_utils::CountingBody;
    use scheduler_transaction::TransactionCoordinator;

    async fn cluster(nodes: &[u64]) -> Arc<LocalCluster> {
        let registry = Arc::new(NodeRegistry::new());
        let identities = Arc::new(IdentityMap::new(4, Duration::from_secs(5)));
        let transactions = Arc::new(TransactionCoordinator::new(&TransactionConfig::default()));
        let mut schedulers = Vec::new();
        for node in nodes {
            registry
                .register(NodeId(*node), &format!("node-{node}"))
                .await;
            schedulers.push(TaskScheduler::new(
                NodeId(*node),
                &SchedulerConfig::default(),
                transactions.clone(),
                identities.clone(),
                Arc::new(ImmediateRetryPolicy),
            ));
        }
        let coordinator = Arc::new(GroupCoordinator::new(
            registry,
            identities,
            transactions,
            Arc::new(RoundRobinPolicy::new()),
        ));
        LocalCluster::new(coordinator, schedulers)
    }

    #[tokio::test]
    async fn test_schedule_routes_to_owner() {
        let cluster = cluster(&[1, 2]).await;
        let body = Arc::new(CountingBody::new("count"));

        let first = cluster
            .schedule(NewTask::new(body.clone(), "alice"), None)
            .await
            .unwrap();
        let second = cluster
            .schedule(NewTask::new(body.clone(), "alice"), Some(NodeId(2)))
            .await
            .unwrap();

        // 同一身份的任务总是落在同一个节点
        assert_eq!(first.id().node, second.id().node);
        let owner = first.id().node;
        assert_eq!(cluster.scheduler(owner).unwrap().pending_count(), 2);
    }

    #[tokio::test]
    async fn test_schedule_unknown_owner_fails() {
        let cluster = cluster(&[1]).await;
        cluster
            .coordinator()
            .identities()
            .assign(&IdentityId::from("remote"), NodeId(9));

        let body = Arc::new(CountingBody::new("count"));
        let err = cluster
            .schedule(NewTask::new(body, "remote"), None)
            .await
            .unwrap_err();
        assert_eq!(err, SchedulerError::NodeNotFound { id: NodeId(9) });
    }

    #[tokio::test]
    async fn test_rehome_pending_follows_ownership() {
        let cluster = cluster(&[1, 2]).await;
        let identities = cluster.coordinator().identities().clone();
        identities.assign(&IdentityId::from("alice"), NodeId(1));
        identities.assign(&IdentityId::from("bob"), NodeId(1));

        let body = Arc::new(CountingBody::new("count"));
        for identity in ["alice", "bob"] {
            cluster
                .schedule(NewTask::new(body.clone(), identity), None)
                .await
                .unwrap();
        }
        assert_eq!(cluster.scheduler(NodeId(1)).unwrap().pending_count(), 2);

        identities.remove(&IdentityId::from("alice"));
        identities.assign(&IdentityId::from("alice"), NodeId(2));

        assert_eq!(cluster.rehome_pending(NodeId(1)), 1);
        assert_eq!(cluster.scheduler(NodeId(1)).unwrap().pending_count(), 1);
        assert_eq!(cluster.scheduler(NodeId(2)).unwrap().pending_count(), 1);
    }
}
