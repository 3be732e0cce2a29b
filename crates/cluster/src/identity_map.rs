use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use scheduler_core::{
    IdentityId, IdentityLocation, IdentityOwnership, NodeId, Participant, PrepareVote,
    SchedulerError, SchedulerResult, TxnId,
};
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mapping {
    Mapped(NodeId),
    InTransit {
        from: NodeId,
        to: NodeId,
        expires_at: Instant,
    },
}

impl Mapping {
    fn location(self) -> IdentityLocation {
        match self {
            Mapping::Mapped(node) => IdentityLocation::Owned(node),
            Mapping::InTransit { from, to, .. } => IdentityLocation::InTransit { from, to },
        }
    }
}

/// `begin_move` 的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveStart {
    Started,
    /// 身份已经不在原节点上，本次迁移什么也不做
    AlreadyMoved,
}

/// 身份到节点的映射
///
/// 按身份哈希分片加锁，互不相关的身份不会争用同一把锁。
/// 迁移期间身份处于 in transit 状态，窗口过期仍未完成的迁移在下次访问时回滚。
#[derive(Debug)]
pub struct IdentityMap {
    shards: Vec<Mutex<BTreeMap<IdentityId, Mapping>>>,
    move_expire: Duration,
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// 回滚已过期的迁移窗口
fn expire_move(identity: &IdentityId, mapping: &mut Mapping, now: Instant) {
    if let Mapping::InTransit {
        from,
        to,
        expires_at,
    } = *mapping
    {
        if expires_at <= now {
            warn!(identity = %identity, from = %from, to = %to, "身份迁移窗口已过期，回滚到原节点");
            *mapping = Mapping::Mapped(from);
        }
    }
}

impl IdentityMap {
    pub fn new(shards: usize, move_expire: Duration) -> Self {
        let shards = (0..shards.max(1))
            .map(|_| Mutex::new(BTreeMap::new()))
            .collect();
        Self {
            shards,
            move_expire,
        }
    }

    fn shard(&self, identity: &IdentityId) -> &Mutex<BTreeMap<IdentityId, Mapping>> {
        let mut hasher = DefaultHasher::new();
        identity.hash(&mut hasher);
        let index = (hasher.finish() % self.shards.len() as u64) as usize;
        &self.shards[index]
    }

    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| lock_unpoisoned(shard).len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 为尚未分配的身份指定节点，返回身份最终所在的位置
    ///
    /// 已分配的身份保持不变。
    pub fn assign(&self, identity: &IdentityId, node: NodeId) -> IdentityLocation {
        let mut shard = lock_unpoisoned(self.shard(identity));
        let mapping = shard
            .entry(identity.clone())
            .or_insert(Mapping::Mapped(node));
        expire_move(identity, mapping, Instant::now());
        mapping.location()
    }

    /// 开始迁移：身份进入 in transit 状态直到提交、回滚或过期
    pub fn begin_move(
        &self,
        identity: &IdentityId,
        from: NodeId,
        to: NodeId,
    ) -> SchedulerResult<MoveStart> {
        let mut shard = lock_unpoisoned(self.shard(identity));
        let Some(mapping) = shard.get_mut(identity) else {
            return Ok(MoveStart::AlreadyMoved);
        };
        let now = Instant::now();
        expire_move(identity, mapping, now);

        match *mapping {
            Mapping::Mapped(owner) if owner == from => {
                *mapping = Mapping::InTransit {
                    from,
                    to,
                    expires_at: now + self.move_expire,
                };
                debug!(identity = %identity, from = %from, to = %to, "身份开始迁移");
                Ok(MoveStart::Started)
            }
            Mapping::Mapped(_) => Ok(MoveStart::AlreadyMoved),
            Mapping::InTransit { .. } => Err(SchedulerError::IdentityInTransit {
                identity: identity.to_string(),
            }),
        }
    }

    /// 迁移窗口是否仍然有效
    pub fn move_pending(&self, identity: &IdentityId, from: NodeId, to: NodeId) -> bool {
        let shard = lock_unpoisoned(self.shard(identity));
        matches!(
            shard.get(identity),
            Some(Mapping::InTransit { from: f, to: t, expires_at })
                if *f == from && *t == to && *expires_at > Instant::now()
        )
    }

    pub fn complete_move(&self, identity: &IdentityId, to: NodeId) -> SchedulerResult<()> {
        let mut shard = lock_unpoisoned(self.shard(identity));
        match shard.get_mut(identity) {
            Some(mapping) if matches!(*mapping, Mapping::InTransit { to: target, .. } if target == to) => {
                *mapping = Mapping::Mapped(to);
                Ok(())
            }
            other => Err(SchedulerError::invariant(format!(
                "身份 {identity} 没有迁往 {to} 的迁移窗口 (当前: {:?})",
                other.map(|mapping| mapping.location())
            ))),
        }
    }

    /// 回滚迁移；没有进行中的迁移时什么也不做
    pub fn revert_move(&self, identity: &IdentityId) {
        let mut shard = lock_unpoisoned(self.shard(identity));
        if let Some(mapping) = shard.get_mut(identity) {
            if let Mapping::InTransit { from, .. } = *mapping {
                *mapping = Mapping::Mapped(from);
                debug!(identity = %identity, node = %from, "身份迁移已回滚");
            }
        }
    }

    /// 删除永久不再活跃的身份
    pub fn remove(&self, identity: &IdentityId) -> Option<NodeId> {
        lock_unpoisoned(self.shard(identity))
            .remove(identity)
            .map(|mapping| match mapping {
                Mapping::Mapped(node) => node,
                Mapping::InTransit { from, .. } => from,
            })
    }

    /// 当前归属于 `node` 的任意一个身份
    pub fn find_on_node(&self, node: NodeId) -> Option<IdentityId> {
        self.identities_on(node).into_iter().next()
    }

    /// 当前归属于 `node` 的全部身份，迁移中的不计入
    pub fn identities_on(&self, node: NodeId) -> Vec<IdentityId> {
        let now = Instant::now();
        let mut identities = Vec::new();
        for shard in &self.shards {
            let mut shard = lock_unpoisoned(shard);
            for (identity, mapping) in shard.iter_mut() {
                expire_move(identity, mapping, now);
                if *mapping == Mapping::Mapped(node) {
                    identities.push(identity.clone());
                }
            }
        }
        identities.sort();
        identities
    }
}

impl IdentityOwnership for IdentityMap {
    fn location(&self, identity: &IdentityId) -> IdentityLocation {
        let mut shard = lock_unpoisoned(self.shard(identity));
        match shard.get_mut(identity) {
            Some(mapping) => {
                expire_move(identity, mapping, Instant::now());
                mapping.location()
            }
            None => IdentityLocation::Unassigned,
        }
    }
}

/// 在事务中完成一次身份迁移
///
/// 准备阶段确认迁移窗口仍然有效，提交时落定新归属，中止时回滚到原节点。
pub struct IdentityMoveParticipant {
    map: Arc<IdentityMap>,
    identity: IdentityId,
    from: NodeId,
    to: NodeId,
}

impl IdentityMoveParticipant {
    pub fn new(map: Arc<IdentityMap>, identity: IdentityId, from: NodeId, to: NodeId) -> Self {
        Self {
            map,
            identity,
            from,
            to,
        }
    }
}

#[async_trait]
impl Participant for IdentityMoveParticipant {
    fn name(&self) -> &str {
        "identity_map"
    }

    async fn prepare(&self, _txn_id: TxnId) -> SchedulerResult<PrepareVote> {
        if self.map.move_pending(&self.identity, self.from, self.to) {
            Ok(PrepareVote::Prepared)
        } else {
            Err(SchedulerError::Internal(format!(
                "身份 {} 从 {} 到 {} 的迁移窗口已失效",
                self.identity, self.from, self.to
            )))
        }
    }

    async fn commit(&self, _txn_id: TxnId) -> SchedulerResult<()> {
        self.map.complete_move(&self.identity, self.to)
    }

    async fn abort(&self, _txn_id: TxnId) -> SchedulerResult<()> {
        self.map.revert_move(&self.identity);
        Ok(())
    }
}
