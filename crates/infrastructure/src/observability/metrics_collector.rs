//! Metrics collector for the transactional task scheduler
//!
//! Counters and gauges go through the `metrics` facade; without an installed
//! recorder every call is a no-op.

use metrics::{counter, gauge, histogram, Counter, Gauge, Histogram};
use tracing::{debug, info, warn};

/// Metrics collector for the transactional task scheduler
#[derive(Clone)]
pub struct MetricsCollector {
    // Task metrics
    tasks_scheduled_total: Counter,
    tasks_committed_total: Counter,
    tasks_retried_total: Counter,
    tasks_dropped_total: Counter,
    tasks_relocated_total: Counter,
    task_execution_duration: Histogram,

    // Transaction metrics
    transaction_aborts_total: Counter,
    deadlocks_total: Counter,
    lock_timeouts_total: Counter,

    // Cluster metrics
    offloads_total: Counter,
    offload_failures_total: Counter,

    queue_depth: Gauge,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            tasks_scheduled_total: counter!("scheduler_tasks_scheduled_total"),
            tasks_committed_total: counter!("scheduler_tasks_committed_total"),
            tasks_retried_total: counter!("scheduler_tasks_retried_total"),
            tasks_dropped_total: counter!("scheduler_tasks_dropped_total"),
            tasks_relocated_total: counter!("scheduler_tasks_relocated_total"),
            task_execution_duration: histogram!("scheduler_task_execution_duration_seconds"),
            transaction_aborts_total: counter!("scheduler_transaction_aborts_total"),
            deadlocks_total: counter!("scheduler_deadlocks_total"),
            lock_timeouts_total: counter!("scheduler_lock_timeouts_total"),
            offloads_total: counter!("scheduler_identity_offloads_total"),
            offload_failures_total: counter!("scheduler_identity_offload_failures_total"),
            queue_depth: gauge!("scheduler_queue_depth"),
        }
    }

    pub fn record_task_scheduled(&self, task_type: &str, priority: &str) {
        self.tasks_scheduled_total.increment(1);

        debug!(
            task_type = task_type,
            priority = priority,
            "Task scheduled"
        );
    }

    /// Record a committed task run
    pub fn record_task_committed(&self, task_type: &str, duration_seconds: f64) {
        self.tasks_committed_total.increment(1);
        self.task_execution_duration.record(duration_seconds);

        debug!(
            task_type = task_type,
            duration_seconds = duration_seconds,
            "Task committed"
        );
    }

    pub fn record_task_retry(&self, task_type: &str, try_count: u32) {
        self.tasks_retried_total.increment(1);

        info!(
            task_type = task_type,
            try_count = try_count,
            "Task retry initiated"
        );
    }

    pub fn record_task_dropped(&self, task_type: &str) {
        self.tasks_dropped_total.increment(1);

        debug!(task_type = task_type, "Task dropped");
    }

    pub fn record_task_relocated(&self) {
        self.tasks_relocated_total.increment(1);
    }

    /// Record a transaction abort, split by conflict type
    pub fn record_transaction_abort(&self, conflict_type: &str) {
        self.transaction_aborts_total.increment(1);
        counter!("scheduler_transaction_aborts_by_type_total", "conflict_type" => conflict_type.to_string())
            .increment(1);
    }

    pub fn record_deadlock(&self) {
        self.deadlocks_total.increment(1);
    }

    pub fn record_lock_timeout(&self) {
        self.lock_timeouts_total.increment(1);
    }

    pub fn record_offload(&self, success: bool) {
        if success {
            self.offloads_total.increment(1);
        } else {
            self.offload_failures_total.increment(1);
            warn!("Identity offload failed");
        }
    }

    pub fn update_queue_depth(&self, depth: usize) {
        self.queue_depth.set(depth as f64);
    }
}
