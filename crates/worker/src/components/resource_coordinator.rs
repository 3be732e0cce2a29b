use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use scheduler_core::{SchedulerError, SchedulerResult};
use tokio::sync::{OwnedSemaphorePermit, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// 一个工作者名额，释放即归还给池
#[derive(Debug)]
pub struct WorkerPermit {
    _permit: OwnedSemaphorePermit,
}

#[derive(Debug, Clone)]
struct RunningTask {
    label: String,
    started_at: Instant,
}

/// 有界工作者池
///
/// 同时运行的任务数不超过 `max_workers`；调度循环先取得名额再出队，
/// 因此池满时不会从队列里取出任务。
pub struct ResourceCoordinator {
    name: String,
    max_workers: usize,
    semaphore: Arc<Semaphore>,
    running_tasks: Arc<RwLock<HashMap<u64, RunningTask>>>,
    next_slot: AtomicU64,
}

impl ResourceCoordinator {
    pub fn new(name: impl Into<String>, max_workers: usize) -> Self {
        let max_workers = max_workers.max(1);
        Self {
            name: name.into(),
            max_workers,
            semaphore: Arc::new(Semaphore::new(max_workers)),
            running_tasks: Arc::new(RwLock::new(HashMap::new())),
            next_slot: AtomicU64::new(0),
        }
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    pub fn available_workers(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn is_closed(&self) -> bool {
        self.semaphore.is_closed()
    }

    /// 等待一个空闲工作者，池关闭后返回 `SchedulerShutdown`
    pub async fn acquire_worker(&self) -> SchedulerResult<WorkerPermit> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| SchedulerError::SchedulerShutdown)?;
        Ok(WorkerPermit { _permit: permit })
    }

    pub fn try_acquire_worker(&self) -> Option<WorkerPermit> {
        self.semaphore
            .clone()
            .try_acquire_owned()
            .ok()
            .map(|permit| WorkerPermit { _permit: permit })
    }

    /// 在已取得的名额上运行任务，任务结束（包括panic）后归还名额
    pub async fn spawn<F>(&self, permit: WorkerPermit, label: impl Into<String>, task: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let slot = self.next_slot.fetch_add(1, Ordering::Relaxed);
        let label = label.into();
        {
            let mut running_tasks = self.running_tasks.write().await;
            running_tasks.insert(
                slot,
                RunningTask {
                    label: label.clone(),
                    started_at: Instant::now(),
                },
            );
        }

        let running_tasks = Arc::clone(&self.running_tasks);
        let pool = self.name.clone();
        tokio::spawn(async move {
            let panicked = AssertUnwindSafe(task).catch_unwind().await.is_err();
            let finished = running_tasks.write().await.remove(&slot);
            if let Some(finished) = finished {
                let elapsed_ms = finished.started_at.elapsed().as_millis() as u64;
                if panicked {
                    warn!(pool = %pool, task = %finished.label, elapsed_ms, "工作者任务panic");
                } else {
                    debug!(pool = %pool, task = %finished.label, elapsed_ms, "工作者任务结束");
                }
            }
            drop(permit);
        })
    }

    pub async fn running_task_count(&self) -> usize {
        self.running_tasks.read().await.len()
    }

    pub async fn running_labels(&self) -> Vec<String> {
        self.running_tasks
            .read()
            .await
            .values()
            .map(|task| task.label.clone())
            .collect()
    }

    /// 等待所有在途任务结束后关闭池
    ///
    /// 超时返回 `false`，此时仍在运行的任务不会被打断。
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        let all = u32::try_from(self.max_workers).unwrap_or(u32::MAX);
        let drained = tokio::time::timeout(timeout, self.semaphore.acquire_many(all)).await;
        self.semaphore.close();

        match drained {
            Ok(Ok(_permits)) => {
                info!(pool = %self.name, "工作者池已关闭");
                true
            }
            Ok(Err(_)) => true,
            Err(_) => {
                let remaining = self.running_labels().await;
                warn!(
                    pool = %self.name,
                    remaining = remaining.len(),
                    tasks = ?remaining,
                    "等待在途任务超时，强制关闭工作者池"
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_pool_bounds_concurrency() {
        let pool = ResourceCoordinator::new("test", 2);
        let first = pool.acquire_worker().await.unwrap();
        let _second = pool.acquire_worker().await.unwrap();

        assert_eq!(pool.available_workers(), 0);
        assert!(pool.try_acquire_worker().is_none());

        drop(first);
        assert!(pool.try_acquire_worker().is_some());
    }

    #[tokio::test]
    async fn test_spawn_returns_worker_when_done() {
        let pool = ResourceCoordinator::new("test", 1);
        let (release, wait) = oneshot::channel::<()>();
        let permit = pool.acquire_worker().await.unwrap();

        let handle = pool
            .spawn(permit, "blocking", async move {
                let _ = wait.await;
            })
            .await;
        assert_eq!(pool.running_task_count().await, 1);
        assert_eq!(pool.running_labels().await, vec!["blocking".to_string()]);
        assert_eq!(pool.available_workers(), 0);

        release.send(()).unwrap();
        handle.await.unwrap();
        assert_eq!(pool.running_task_count().await, 0);
        assert_eq!(pool.available_workers(), 1);
    }

    #[tokio::test]
    async fn test_panicking_task_returns_worker() {
        let pool = ResourceCoordinator::new("test", 1);
        let permit = pool.acquire_worker().await.unwrap();

        let handle = pool
            .spawn(permit, "panicking", async {
                panic!("boom");
            })
            .await;
        handle.await.unwrap();

        assert_eq!(pool.running_task_count().await, 0);
        assert_eq!(pool.available_workers(), 1);
        assert!(pool.shutdown(Duration::from_millis(100)).await);
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_in_flight_tasks() {
        let pool = ResourceCoordinator::new("test", 2);
        let finished = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let permit = pool.acquire_worker().await.unwrap();
            let finished = finished.clone();
            pool.spawn(permit, "sleeper", async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                finished.fetch_add(1, Ordering::SeqCst);
            })
            .await;
        }

        assert!(pool.shutdown(Duration::from_secs(1)).await);
        assert_eq!(finished.load(Ordering::SeqCst), 2);
        assert!(matches!(
            pool.acquire_worker().await,
            Err(SchedulerError::SchedulerShutdown)
        ));
    }

    #[tokio::test]
    async fn test_shutdown_times_out() {
        let pool = ResourceCoordinator::new("test", 1);
        let permit = pool.acquire_worker().await.unwrap();
        pool.spawn(permit, "stuck", std::future::pending::<()>()).await;

        assert!(!pool.shutdown(Duration::from_millis(20)).await);
        assert!(pool.is_closed());
    }
}
