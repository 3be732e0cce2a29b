//! Structured logging utilities
//!
//! One function per scheduler event so every emitter uses the same field names.

use scheduler_core::{ContentionReport, IdentityId, NodeId, TaskFailure, TaskId, TxnId};
use tracing::{debug, error, info, warn};

/// Structured logging utilities
pub struct StructuredLogger;

impl StructuredLogger {
    pub fn log_task_scheduled(task_id: TaskId, task_type: &str, priority: &str, delayed_ms: u64) {
        debug!(
            event = "task_scheduled",
            task.id = %task_id,
            task.type = task_type,
            task.priority = priority,
            task.delay_ms = delayed_ms,
            "Task scheduled for execution"
        );
    }

    pub fn log_task_committed(task_id: TaskId, txn_id: TxnId, task_type: &str, try_count: u32) {
        debug!(
            event = "task_committed",
            task.id = %task_id,
            txn.id = %txn_id,
            task.type = task_type,
            task.try_count = try_count,
            "Task transaction committed"
        );
    }

    pub fn log_task_retry(task_id: TaskId, task_type: &str, try_count: u32, reason: &TaskFailure) {
        info!(
            event = "task_retry",
            task.id = %task_id,
            task.type = task_type,
            task.try_count = try_count,
            task.retry_reason = %reason,
            "Task retry initiated"
        );
    }

    /// A dropped task is always logged at warning level with its last failure
    pub fn log_task_dropped(
        task_id: TaskId,
        task_type: &str,
        try_count: u32,
        failure: Option<&TaskFailure>,
        recurrence_ended: bool,
    ) {
        let reason = failure
            .map(ToString::to_string)
            .unwrap_or_else(|| "unknown".to_string());
        if recurrence_ended {
            warn!(
                event = "task_dropped",
                task.id = %task_id,
                task.type = task_type,
                task.try_count = try_count,
                task.failure = %reason,
                "Skipping a recurrence of a task that failed"
            );
        } else {
            warn!(
                event = "task_dropped",
                task.id = %task_id,
                task.type = task_type,
                task.try_count = try_count,
                task.failure = %reason,
                "Dropping a task that failed"
            );
        }
    }

    /// Log the contention snapshot of an aborted transaction
    pub fn log_contention_report(report: &ContentionReport) {
        let report_json = serde_json::to_string(report)
            .unwrap_or_else(|e| format!("<unserializable report: {e}>"));
        info!(
            event = "transaction_contention",
            txn.id = %report.txn_id(),
            task.type = report.task_type(),
            conflict.type = %report.conflict_type(),
            locks.acquired = report.acquired_locks().len(),
            locks.contended = report.contended_locks().len(),
            report = %report_json,
            "Transaction aborted due to contention"
        );
    }

    pub fn log_deadlock_detected(victim: TxnId, requester: TxnId, cycle_len: usize) {
        info!(
            event = "deadlock_detected",
            txn.victim = %victim,
            txn.requester = %requester,
            cycle.length = cycle_len,
            "Deadlock detected, aborting victim"
        );
    }

    pub fn log_identity_relocated(identity: &IdentityId, from: NodeId, to: NodeId) {
        info!(
            event = "identity_relocated",
            identity = %identity,
            node.from = %from,
            node.to = %to,
            "Identity moved to a new node"
        );
    }

    pub fn log_task_relocated(task_id: TaskId, identity: &IdentityId, to: NodeId) {
        info!(
            event = "task_relocated",
            task.id = %task_id,
            identity = %identity,
            node.to = %to,
            "Task handed over to the identity's new node"
        );
    }

    pub fn log_offload_failed(node: NodeId, identity: Option<&IdentityId>, error: &str) {
        let identity = identity.map(ToString::to_string).unwrap_or_default();
        warn!(
            event = "offload_failed",
            node.id = %node,
            identity = %identity,
            error = error,
            "Failed to offload identity, will retry"
        );
    }

    pub fn log_node_state_change(node: NodeId, old_status: &str, new_status: &str) {
        info!(
            event = "node_state_change",
            node.id = %node,
            node.old_status = old_status,
            node.new_status = new_status,
            "Node status changed"
        );
    }

    /// Programming errors surface loudly and are never swallowed by the caller
    pub fn log_invariant_violation(component: &str, message: &str) {
        error!(
            event = "invariant_violation",
            component = component,
            error = message,
            "Scheduler invariant violated"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scheduler_core::{ConflictType, LockInfo, LockType, ObjectId};

    #[test]
    fn test_contention_report_serializes() {
        let report = ContentionReport::new(
            TxnId(4),
            "transfer",
            vec![LockInfo::new(ObjectId(1), Some("a"), LockType::Write)],
            vec![LockInfo::new(ObjectId(2), None, LockType::Read)],
            ConflictType::Deadlock,
            None,
        );
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["conflict_type"], "DEADLOCK");
        assert_eq!(json["acquired_locks"][0]["bound_name"], "a");

        StructuredLogger::log_contention_report(&report);
    }
}
