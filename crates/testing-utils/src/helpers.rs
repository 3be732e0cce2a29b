//! Test helper utilities and common testing patterns
//!
//! This module provides utilities for setting up schedulers in tests and
//! waiting on asynchronous outcomes.

use std::sync::Arc;
use std::time::Duration;

use scheduler_core::{
    IdentityOwnership, NodeId, PriorityWeights, SchedulerConfig, TransactionConfig,
};
use scheduler_dispatcher::{ImmediateRetryPolicy, RetryPolicy, TaskScheduler};
use scheduler_transaction::TransactionCoordinator;
use tokio::time::{sleep, Instant};

/// Test environment setup utilities
pub struct TestEnv;

impl TestEnv {
    /// Wait for a condition to be true with timeout
    ///
    /// Uses tokio time, so it also works in tests running with paused time.
    pub async fn wait_for<F>(condition: F, timeout: Duration) -> bool
    where
        F: FnMut() -> bool,
    {
        Self::wait_for_with_interval(condition, timeout, Duration::from_millis(10)).await
    }

    /// Wait for a condition with a custom poll interval
    pub async fn wait_for_with_interval<F>(
        mut condition: F,
        timeout: Duration,
        poll_interval: Duration,
    ) -> bool
    where
        F: FnMut() -> bool,
    {
        let deadline = Instant::now() + timeout;
        loop {
            if condition() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            sleep(poll_interval).await;
        }
    }

    pub fn transaction_coordinator() -> Arc<TransactionCoordinator> {
        Arc::new(TransactionCoordinator::new(&TransactionConfig::default()))
    }

    /// Scheduler config with the given pool size and default weights
    pub fn scheduler_config(workers: usize) -> SchedulerConfig {
        SchedulerConfig {
            worker_threads: workers,
            priority_weights: PriorityWeights::default(),
            ..SchedulerConfig::default()
        }
    }

    /// Scheduler for node 1 with the immediate retry policy
    pub fn scheduler(workers: usize, ownership: Arc<dyn IdentityOwnership>) -> TaskScheduler {
        Self::scheduler_with_policy(workers, ownership, Arc::new(ImmediateRetryPolicy))
    }

    pub fn scheduler_with_policy(
        workers: usize,
        ownership: Arc<dyn IdentityOwnership>,
        retry_policy: Arc<dyn RetryPolicy>,
    ) -> TaskScheduler {
        TaskScheduler::new(
            NodeId(1),
            &Self::scheduler_config(workers),
            Self::transaction_coordinator(),
            ownership,
            retry_policy,
        )
    }
}
