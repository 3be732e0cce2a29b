//! 锁追踪器
//!
//! 按对象ID分片保存锁表：读锁共享，写锁独占，读锁升级为写锁要求没有其他持有者。
//! 请求无法立即授予时，请求方进入该对象的FIFO等待队列，并沿等待图做环检测；
//! 发现死锁时选择环中最晚开始的事务作为牺牲者。等待超时归类为 LOCK_NOT_GRANTED。
//!
//! 分片互斥量与事务状态互斥量从不同时持有。

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use scheduler_core::{
    ConflictType, LockConflict, LockInfo, LockType, ObjectId, SchedulerError, SchedulerResult,
    TransactionConfig, TxnId,
};
use scheduler_infrastructure::{MetricsCollector, StructuredLogger};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace};

#[derive(Debug, Clone)]
pub struct LockTrackerConfig {
    /// 等待锁的最长时间
    pub lock_timeout: Duration,
    pub shards: usize,
    pub detect_deadlocks: bool,
}

impl Default for LockTrackerConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(1),
            shards: 16,
            detect_deadlocks: true,
        }
    }
}

impl From<&TransactionConfig> for LockTrackerConfig {
    fn from(config: &TransactionConfig) -> Self {
        Self {
            lock_timeout: config.lock_timeout(),
            shards: config.lock_shards,
            detect_deadlocks: config.detect_deadlocks,
        }
    }
}

/// 锁请求的结果
///
/// `try_acquire` 只返回 `Granted` 或 `WouldBlock`；`acquire` 只返回 `Granted` 或 `Denied`。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockOutcome {
    Granted,
    /// 不等待时锁被其他事务占用
    WouldBlock(LockConflict),
    /// 等待后仍未获得：死锁牺牲者或等待超时
    Denied(LockConflict),
}

impl LockOutcome {
    pub fn is_granted(&self) -> bool {
        matches!(self, LockOutcome::Granted)
    }

    pub fn conflict(&self) -> Option<&LockConflict> {
        match self {
            LockOutcome::Granted => None,
            LockOutcome::WouldBlock(conflict) | LockOutcome::Denied(conflict) => Some(conflict),
        }
    }
}

#[derive(Debug, Default)]
struct LockerState {
    /// 按获取顺序
    acquired: Vec<LockInfo>,
    waiting_for: Option<LockInfo>,
    conflict: Option<LockConflict>,
}

/// 每个事务在锁表中的身份
struct Locker {
    txn_id: TxnId,
    /// 决定死锁牺牲者，任务重试时保持不变
    requested_start: u64,
    task_type: String,
    state: Mutex<LockerState>,
    notify: Notify,
}

#[derive(Debug, Clone, Copy)]
struct Waiter {
    txn_id: TxnId,
    lock_type: LockType,
}

#[derive(Debug, Default)]
struct LockEntry {
    owners: Vec<(TxnId, LockType)>,
    waiters: VecDeque<Waiter>,
}

fn conflicts(a: LockType, b: LockType) -> bool {
    a.is_write() || b.is_write()
}

impl LockEntry {
    fn held_by(&self, txn_id: TxnId) -> Option<LockType> {
        self.owners
            .iter()
            .find(|(owner, _)| *owner == txn_id)
            .map(|(_, lock_type)| *lock_type)
    }

    fn satisfies(&self, txn_id: TxnId, lock_type: LockType) -> bool {
        match self.held_by(txn_id) {
            Some(held) => held.is_write() || !lock_type.is_write(),
            None => false,
        }
    }

    fn blocking_owners(&self, txn_id: TxnId, lock_type: LockType) -> Vec<TxnId> {
        self.owners
            .iter()
            .filter(|(owner, held)| *owner != txn_id && conflicts(*held, lock_type))
            .map(|(owner, _)| *owner)
            .collect()
    }

    /// 等待图中 `txn_id` 指向的边：冲突的持有者，以及排在它前面且冲突的等待者
    ///
    /// 已被授予锁、但等待方还没醒来的事务不再等待任何人。
    fn wait_edges(&self, txn_id: TxnId, lock_type: LockType) -> Vec<TxnId> {
        if self.satisfies(txn_id, lock_type) {
            return Vec::new();
        }
        let mut edges = self.blocking_owners(txn_id, lock_type);
        for waiter in &self.waiters {
            if waiter.txn_id == txn_id {
                break;
            }
            if conflicts(waiter.lock_type, lock_type) && !edges.contains(&waiter.txn_id) {
                edges.push(waiter.txn_id);
            }
        }
        edges
    }

    fn grant(&mut self, txn_id: TxnId, lock_type: LockType) {
        match self.owners.iter_mut().find(|(owner, _)| *owner == txn_id) {
            Some(owner) => {
                if lock_type.is_write() {
                    owner.1 = LockType::Write;
                }
            }
            None => self.owners.push((txn_id, lock_type)),
        }
    }

    fn remove_waiter(&mut self, txn_id: TxnId) {
        self.waiters.retain(|waiter| waiter.txn_id != txn_id);
    }

    /// 从队首起依次授予兼容的等待者，遇到第一个不兼容的即停止
    fn promote_waiters(&mut self) -> Vec<TxnId> {
        let mut granted = Vec::new();
        while let Some(waiter) = self.waiters.front().copied() {
            if !self.blocking_owners(waiter.txn_id, waiter.lock_type).is_empty() {
                break;
            }
            self.waiters.pop_front();
            self.grant(waiter.txn_id, waiter.lock_type);
            granted.push(waiter.txn_id);
        }
        granted
    }

    fn is_idle(&self) -> bool {
        self.owners.is_empty() && self.waiters.is_empty()
    }
}

enum Attempt {
    Granted,
    Blocked(LockConflict),
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// 记录每个事务获取的锁，并在冲突时进行死锁检测
pub struct LockTracker {
    config: LockTrackerConfig,
    shards: Vec<Mutex<HashMap<ObjectId, LockEntry>>>,
    lockers: RwLock<HashMap<TxnId, Arc<Locker>>>,
    metrics: MetricsCollector,
}

impl LockTracker {
    pub fn new(config: LockTrackerConfig) -> Self {
        let shard_count = config.shards.max(1);
        Self {
            shards: (0..shard_count).map(|_| Mutex::new(HashMap::new())).collect(),
            lockers: RwLock::new(HashMap::new()),
            metrics: MetricsCollector::new(),
            config,
        }
    }

    pub fn config(&self) -> &LockTrackerConfig {
        &self.config
    }

    /// 事务开始时登记，`requested_start` 越大越容易被选为死锁牺牲者
    pub fn register(&self, txn_id: TxnId, requested_start: u64, task_type: &str) {
        let locker = Arc::new(Locker {
            txn_id,
            requested_start,
            task_type: task_type.to_string(),
            state: Mutex::new(LockerState::default()),
            notify: Notify::new(),
        });
        self.lockers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(txn_id, locker);
    }

    pub fn is_registered(&self, txn_id: TxnId) -> bool {
        self.get_locker(txn_id).is_some()
    }

    pub fn task_type_of(&self, txn_id: TxnId) -> Option<String> {
        self.get_locker(txn_id).map(|locker| locker.task_type.clone())
    }

    /// 按获取顺序返回事务当前持有的锁
    pub fn acquired_locks(&self, txn_id: TxnId) -> Vec<LockInfo> {
        self.get_locker(txn_id)
            .map(|locker| lock_unpoisoned(&locker.state).acquired.clone())
            .unwrap_or_default()
    }

    /// 对象当前的持有者
    pub fn holders(&self, object_id: ObjectId) -> Vec<(TxnId, LockType)> {
        lock_unpoisoned(self.shard(object_id))
            .get(&object_id)
            .map(|entry| entry.owners.clone())
            .unwrap_or_default()
    }

    /// 尝试获取锁，不等待
    pub fn try_acquire(
        &self,
        txn_id: TxnId,
        object_id: ObjectId,
        bound_name: Option<&str>,
        lock_type: LockType,
    ) -> SchedulerResult<LockOutcome> {
        let locker = self.locker(txn_id)?;
        let info = LockInfo::new(object_id, bound_name, lock_type);
        match self.request(&locker, &info, false)? {
            Attempt::Granted => Ok(LockOutcome::Granted),
            Attempt::Blocked(conflict) => Ok(LockOutcome::WouldBlock(conflict)),
        }
    }

    /// 获取锁，必要时等待
    ///
    /// 等待中被选为死锁牺牲者时立即返回 `Denied(DEADLOCK)`，
    /// 超过 `lock_timeout` 返回 `Denied(LOCK_NOT_GRANTED)`。
    pub async fn acquire(
        &self,
        txn_id: TxnId,
        object_id: ObjectId,
        bound_name: Option<&str>,
        lock_type: LockType,
    ) -> SchedulerResult<LockOutcome> {
        let locker = self.locker(txn_id)?;
        let info = LockInfo::new(object_id, bound_name, lock_type);
        let blocked = match self.request(&locker, &info, true)? {
            Attempt::Granted => return Ok(LockOutcome::Granted),
            Attempt::Blocked(conflict) => conflict,
        };

        if self.config.detect_deadlocks {
            self.check_deadlock(&locker);
        }

        Ok(self.wait_for_grant(&locker, &info, blocked).await)
    }

    /// 释放事务的全部锁并唤醒可以获得锁的等待者
    pub fn release_all(&self, txn_id: TxnId) -> Vec<LockInfo> {
        let removed = self
            .lockers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&txn_id);
        let Some(locker) = removed else {
            return Vec::new();
        };

        let (acquired, waiting) = {
            let mut state = lock_unpoisoned(&locker.state);
            (
                std::mem::take(&mut state.acquired),
                state.waiting_for.take(),
            )
        };

        let mut objects: Vec<ObjectId> = acquired.iter().map(|info| info.object_id).collect();
        if let Some(waiting) = &waiting {
            objects.push(waiting.object_id);
        }
        objects.sort();
        objects.dedup();

        let mut to_notify = Vec::new();
        for object_id in objects {
            let mut shard = lock_unpoisoned(self.shard(object_id));
            if let Some(entry) = shard.get_mut(&object_id) {
                entry.owners.retain(|(owner, _)| *owner != txn_id);
                entry.remove_waiter(txn_id);
                to_notify.extend(entry.promote_waiters());
                if entry.is_idle() {
                    shard.remove(&object_id);
                }
            }
        }
        self.notify(&to_notify);

        trace!(txn_id = %txn_id, released = acquired.len(), "释放事务持有的锁");
        acquired
    }

    fn shard(&self, object_id: ObjectId) -> &Mutex<HashMap<ObjectId, LockEntry>> {
        let index = (object_id.0 % self.shards.len() as u64) as usize;
        &self.shards[index]
    }

    fn get_locker(&self, txn_id: TxnId) -> Option<Arc<Locker>> {
        self.lockers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&txn_id)
            .cloned()
    }

    fn locker(&self, txn_id: TxnId) -> SchedulerResult<Arc<Locker>> {
        self.get_locker(txn_id).ok_or_else(|| {
            SchedulerError::invariant(format!("事务 {txn_id} 未在锁追踪器中登记"))
        })
    }

    fn notify(&self, txn_ids: &[TxnId]) {
        for txn_id in txn_ids {
            if let Some(locker) = self.get_locker(*txn_id) {
                locker.notify.notify_one();
            }
        }
    }

    fn request(&self, locker: &Locker, info: &LockInfo, wait: bool) -> SchedulerResult<Attempt> {
        {
            let mut state = lock_unpoisoned(&locker.state);
            if state.waiting_for.is_some() {
                return Err(SchedulerError::invariant(format!(
                    "事务 {} 在等待锁时请求了新的锁",
                    locker.txn_id
                )));
            }
            if let Some(conflict) = &state.conflict {
                if conflict.conflict_type == ConflictType::Deadlock {
                    return Err(SchedulerError::invariant(format!(
                        "事务 {} 已被选为死锁牺牲者，不能再请求锁",
                        locker.txn_id
                    )));
                }
                state.conflict = None;
            }
        }

        let txn_id = locker.txn_id;
        let blocker = {
            let mut shard = lock_unpoisoned(self.shard(info.object_id));
            let entry = shard.entry(info.object_id).or_default();
            if entry.satisfies(txn_id, info.lock_type) {
                return Ok(Attempt::Granted);
            }

            let upgrade = entry.held_by(txn_id).is_some();
            let blockers = entry.blocking_owners(txn_id, info.lock_type);
            if blockers.is_empty() && (upgrade || entry.waiters.is_empty()) {
                entry.grant(txn_id, info.lock_type);
                None
            } else {
                let blocker = blockers
                    .first()
                    .copied()
                    .or_else(|| entry.waiters.front().map(|waiter| waiter.txn_id));
                if wait {
                    let waiter = Waiter {
                        txn_id,
                        lock_type: info.lock_type,
                    };
                    if upgrade {
                        entry.waiters.push_front(waiter);
                    } else {
                        entry.waiters.push_back(waiter);
                    }
                }
                Some(blocker)
            }
        };

        let mut state = lock_unpoisoned(&locker.state);
        match blocker {
            None => {
                state.acquired.push(info.clone());
                Ok(Attempt::Granted)
            }
            Some(conflicting_txn) => {
                if wait {
                    state.waiting_for = Some(info.clone());
                }
                Ok(Attempt::Blocked(LockConflict {
                    conflict_type: ConflictType::LockNotGranted,
                    requested: info.clone(),
                    conflicting_txn,
                }))
            }
        }
    }

    async fn wait_for_grant(
        &self,
        locker: &Arc<Locker>,
        info: &LockInfo,
        blocked: LockConflict,
    ) -> LockOutcome {
        let deadline = Instant::now() + self.config.lock_timeout;
        loop {
            let notified = locker.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let conflict = lock_unpoisoned(&locker.state).conflict.clone();
            if conflict.is_some() {
                return self.finish_wait(locker, info, conflict);
            }
            if self.is_owner(locker.txn_id, info) {
                return self.finish_wait(locker, info, None);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                let conflict = lock_unpoisoned(&locker.state)
                    .conflict
                    .get_or_insert_with(|| blocked.clone())
                    .clone();
                return self.finish_wait(locker, info, Some(conflict));
            }
        }
    }

    fn is_owner(&self, txn_id: TxnId, info: &LockInfo) -> bool {
        lock_unpoisoned(self.shard(info.object_id))
            .get(&info.object_id)
            .is_some_and(|entry| entry.satisfies(txn_id, info.lock_type))
    }

    /// 结束等待：撤回仍在排队的请求，并据最终状态给出结果
    fn finish_wait(
        &self,
        locker: &Locker,
        info: &LockInfo,
        conflict: Option<LockConflict>,
    ) -> LockOutcome {
        let txn_id = locker.txn_id;
        let (owner, promoted) = {
            let mut shard = lock_unpoisoned(self.shard(info.object_id));
            match shard.get_mut(&info.object_id) {
                Some(entry) if entry.satisfies(txn_id, info.lock_type) => (true, Vec::new()),
                Some(entry) => {
                    entry.remove_waiter(txn_id);
                    let promoted = entry.promote_waiters();
                    if entry.is_idle() {
                        shard.remove(&info.object_id);
                    }
                    (false, promoted)
                }
                None => (false, Vec::new()),
            }
        };
        self.notify(&promoted);

        let mut state = lock_unpoisoned(&locker.state);
        state.waiting_for = None;
        if owner {
            // 即使随后作为牺牲者中止，也要记下这把锁以便释放
            state.acquired.push(info.clone());
        }

        match conflict {
            Some(conflict) if conflict.conflict_type == ConflictType::Deadlock => {
                LockOutcome::Denied(conflict)
            }
            Some(_) if owner => {
                state.conflict = None;
                LockOutcome::Granted
            }
            Some(conflict) => {
                self.metrics.record_lock_timeout();
                debug!(
                    txn_id = %txn_id,
                    object_id = %info.object_id,
                    lock_type = %info.lock_type,
                    "等待锁超时"
                );
                LockOutcome::Denied(conflict)
            }
            None => LockOutcome::Granted,
        }
    }

    /// 以 `root` 为起点反复检测等待环，直到没有环或 `root` 自己成为牺牲者
    fn check_deadlock(&self, root: &Arc<Locker>) {
        let mut excluded = HashSet::new();
        loop {
            let Some(cycle) = self.find_cycle(root.txn_id, &excluded) else {
                return;
            };
            let victim = cycle
                .iter()
                .filter_map(|txn_id| self.get_locker(*txn_id))
                .max_by_key(|locker| (locker.requested_start, locker.txn_id));
            let Some(victim) = victim else {
                return;
            };

            let position = cycle
                .iter()
                .position(|txn_id| *txn_id == victim.txn_id)
                .unwrap_or(0);
            let waits_on = cycle[(position + 1) % cycle.len()];

            self.metrics.record_deadlock();
            StructuredLogger::log_deadlock_detected(victim.txn_id, root.txn_id, cycle.len());
            self.mark_victim(&victim, waits_on);

            if victim.txn_id == root.txn_id {
                return;
            }
            excluded.insert(victim.txn_id);
        }
    }

    fn find_cycle(&self, root: TxnId, excluded: &HashSet<TxnId>) -> Option<Vec<TxnId>> {
        let mut path = Vec::new();
        let mut visited = HashSet::new();
        self.visit(root, excluded, &mut path, &mut visited)
    }

    fn visit(
        &self,
        txn_id: TxnId,
        excluded: &HashSet<TxnId>,
        path: &mut Vec<TxnId>,
        visited: &mut HashSet<TxnId>,
    ) -> Option<Vec<TxnId>> {
        if let Some(start) = path.iter().position(|on_path| *on_path == txn_id) {
            return Some(path[start..].to_vec());
        }
        if excluded.contains(&txn_id) || !visited.insert(txn_id) {
            return None;
        }

        path.push(txn_id);
        for next in self.waits_for(txn_id) {
            if let Some(cycle) = self.visit(next, excluded, path, visited) {
                return Some(cycle);
            }
        }
        path.pop();
        None
    }

    fn waits_for(&self, txn_id: TxnId) -> Vec<TxnId> {
        let Some(locker) = self.get_locker(txn_id) else {
            return Vec::new();
        };
        let Some(target) = lock_unpoisoned(&locker.state).waiting_for.clone() else {
            return Vec::new();
        };
        lock_unpoisoned(self.shard(target.object_id))
            .get(&target.object_id)
            .map(|entry| entry.wait_edges(txn_id, target.lock_type))
            .unwrap_or_default()
    }

    fn mark_victim(&self, victim: &Locker, waits_on: TxnId) {
        {
            let mut state = lock_unpoisoned(&victim.state);
            let Some(target) = state.waiting_for.clone() else {
                return;
            };
            if state.conflict.is_none() {
                state.conflict = Some(LockConflict {
                    conflict_type: ConflictType::Deadlock,
                    requested: target,
                    conflicting_txn: Some(waits_on),
                });
            }
        }
        victim.notify.notify_one();
    }
}
