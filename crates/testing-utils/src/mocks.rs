//! Mock implementations of participants, task bodies and ownership
//!
//! All mocks are hand-written and record what happened to them so tests can
//! assert on callbacks, run counts and timings.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use scheduler_core::{
    IdentityId, IdentityLocation, IdentityOwnership, LockType, NodeId, ObjectId, Participant,
    PrepareVote, SchedulerError, SchedulerResult, TaskFailure, TxnId,
};
use scheduler_dispatcher::TaskBody;
use scheduler_transaction::Transaction;
use tokio::time::Instant;

/// Callback received by a participant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParticipantEvent {
    Prepare(TxnId),
    Commit(TxnId),
    Abort(TxnId),
}

/// Participant that records every callback
#[derive(Debug)]
pub struct RecordingParticipant {
    name: String,
    vote: PrepareVote,
    events: Mutex<Vec<ParticipantEvent>>,
}

impl RecordingParticipant {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            vote: PrepareVote::Prepared,
            events: Mutex::new(Vec::new()),
        })
    }

    /// Participant that votes read-only at prepare
    pub fn read_only(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            vote: PrepareVote::ReadOnly,
            events: Mutex::new(Vec::new()),
        })
    }

    pub fn events(&self) -> Vec<ParticipantEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn prepare_count(&self) -> usize {
        self.count(|event| matches!(event, ParticipantEvent::Prepare(_)))
    }

    pub fn commit_count(&self) -> usize {
        self.count(|event| matches!(event, ParticipantEvent::Commit(_)))
    }

    pub fn abort_count(&self) -> usize {
        self.count(|event| matches!(event, ParticipantEvent::Abort(_)))
    }

    fn count(&self, predicate: impl Fn(&ParticipantEvent) -> bool) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|event| predicate(event))
            .count()
    }

    fn record(&self, event: ParticipantEvent) {
        self.events.lock().unwrap().push(event);
    }
}

#[async_trait]
impl Participant for RecordingParticipant {
    fn name(&self) -> &str {
        &self.name
    }

    async fn prepare(&self, txn_id: TxnId) -> SchedulerResult<PrepareVote> {
        self.record(ParticipantEvent::Prepare(txn_id));
        Ok(self.vote)
    }

    async fn commit(&self, txn_id: TxnId) -> SchedulerResult<()> {
        self.record(ParticipantEvent::Commit(txn_id));
        Ok(())
    }

    async fn abort(&self, txn_id: TxnId) -> SchedulerResult<()> {
        self.record(ParticipantEvent::Abort(txn_id));
        Ok(())
    }
}

/// Participant that always refuses to prepare
#[derive(Debug)]
pub struct VetoParticipant {
    name: String,
    message: String,
    aborts: AtomicUsize,
    commits: AtomicUsize,
}

impl VetoParticipant {
    pub fn new(name: &str, message: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            message: message.to_string(),
            aborts: AtomicUsize::new(0),
            commits: AtomicUsize::new(0),
        })
    }

    pub fn abort_count(&self) -> usize {
        self.aborts.load(Ordering::SeqCst)
    }

    pub fn commit_count(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Participant for VetoParticipant {
    fn name(&self) -> &str {
        &self.name
    }

    async fn prepare(&self, _txn_id: TxnId) -> SchedulerResult<PrepareVote> {
        Err(SchedulerError::ParticipantVeto {
            participant: self.name.clone(),
            message: self.message.clone(),
        })
    }

    async fn commit(&self, _txn_id: TxnId) -> SchedulerResult<()> {
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn abort(&self, _txn_id: TxnId) -> SchedulerResult<()> {
        self.aborts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Task body that counts its runs and remembers when they started
#[derive(Debug)]
pub struct CountingBody {
    task_type: String,
    hold: Option<Duration>,
    runs: AtomicUsize,
    run_times: Mutex<Vec<Instant>>,
}

impl CountingBody {
    pub fn new(task_type: &str) -> Self {
        Self {
            task_type: task_type.to_string(),
            hold: None,
            runs: AtomicUsize::new(0),
            run_times: Mutex::new(Vec::new()),
        }
    }

    /// Keep the worker busy for `hold` on every run
    pub fn with_hold(mut self, hold: Duration) -> Self {
        self.hold = Some(hold);
        self
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    pub fn run_times(&self) -> Vec<Instant> {
        self.run_times.lock().unwrap().clone()
    }
}

#[async_trait]
impl TaskBody for CountingBody {
    fn task_type(&self) -> &str {
        &self.task_type
    }

    async fn run(&self, _txn: &mut Transaction) -> Result<(), TaskFailure> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        self.run_times.lock().unwrap().push(Instant::now());
        if let Some(hold) = self.hold {
            tokio::time::sleep(hold).await;
        }
        Ok(())
    }
}

/// Task body that fails with a fixed failure
#[derive(Debug)]
pub struct FailingBody {
    task_type: String,
    failure: TaskFailure,
    fail_times: Option<usize>,
    attempts: AtomicUsize,
}

impl FailingBody {
    /// Fail on every run
    pub fn always(failure: TaskFailure) -> Self {
        Self {
            task_type: "failing_task".to_string(),
            failure,
            fail_times: None,
            attempts: AtomicUsize::new(0),
        }
    }

    /// Fail the first `times` runs, then succeed
    pub fn times(times: usize, failure: TaskFailure) -> Self {
        Self {
            fail_times: Some(times),
            ..Self::always(failure)
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TaskBody for FailingBody {
    fn task_type(&self) -> &str {
        &self.task_type
    }

    async fn run(&self, _txn: &mut Transaction) -> Result<(), TaskFailure> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        match self.fail_times {
            Some(times) if attempt > times => Ok(()),
            _ => Err(self.failure.clone()),
        }
    }
}

/// Task body that joins an optional participant and then panics
pub struct PanickingBody {
    participant: Option<Arc<dyn Participant>>,
    attempts: AtomicUsize,
}

impl PanickingBody {
    pub fn new() -> Self {
        Self {
            participant: None,
            attempts: AtomicUsize::new(0),
        }
    }

    pub fn with_participant(mut self, participant: Arc<dyn Participant>) -> Self {
        self.participant = Some(participant);
        self
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl Default for PanickingBody {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskBody for PanickingBody {
    fn task_type(&self) -> &str {
        "panicking_task"
    }

    async fn run(&self, txn: &mut Transaction) -> Result<(), TaskFailure> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(participant) = &self.participant {
            txn.join(Arc::clone(participant))
                .map_err(|e| TaskFailure::invariant(&e))?;
        }
        panic!("task body panicked");
    }
}

/// Task body that locks objects in order, optionally pausing between them
pub struct LockingBody {
    task_type: String,
    locks: Vec<(ObjectId, LockType)>,
    pause: Duration,
    swallow_conflicts: bool,
    participant: Option<Arc<dyn Participant>>,
    runs: AtomicUsize,
    failures: Mutex<Vec<TaskFailure>>,
}

impl LockingBody {
    pub fn new(task_type: &str, locks: Vec<(ObjectId, LockType)>) -> Self {
        Self {
            task_type: task_type.to_string(),
            locks,
            pause: Duration::ZERO,
            swallow_conflicts: false,
            participant: None,
            runs: AtomicUsize::new(0),
            failures: Mutex::new(Vec::new()),
        }
    }

    /// Sleep between two lock requests
    pub fn with_pause(mut self, pause: Duration) -> Self {
        self.pause = pause;
        self
    }

    /// Return success even when a lock request fails
    pub fn swallowing_conflicts(mut self) -> Self {
        self.swallow_conflicts = true;
        self
    }

    pub fn with_participant(mut self, participant: Arc<dyn Participant>) -> Self {
        self.participant = Some(participant);
        self
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    /// Lock failures seen by the body
    pub fn failures(&self) -> Vec<TaskFailure> {
        self.failures.lock().unwrap().clone()
    }
}

#[async_trait]
impl TaskBody for LockingBody {
    fn task_type(&self) -> &str {
        &self.task_type
    }

    async fn run(&self, txn: &mut Transaction) -> Result<(), TaskFailure> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        if let Some(participant) = &self.participant {
            txn.join(Arc::clone(participant))
                .map_err(|e| TaskFailure::invariant(&e))?;
        }

        for (index, (object_id, lock_type)) in self.locks.iter().enumerate() {
            if index > 0 && !self.pause.is_zero() {
                tokio::time::sleep(self.pause).await;
            }
            if let Err(failure) = txn.lock(*object_id, None, *lock_type).await {
                self.failures.lock().unwrap().push(failure.clone());
                if self.swallow_conflicts {
                    return Ok(());
                }
                return Err(failure);
            }
        }
        Ok(())
    }
}

/// Ownership map with a fixed default location
#[derive(Debug)]
pub struct StaticOwnership {
    default: IdentityLocation,
    locations: Mutex<HashMap<IdentityId, IdentityLocation>>,
}

impl StaticOwnership {
    /// Every identity is owned by `node` unless overridden
    pub fn owned_by(node: u64) -> Arc<Self> {
        Arc::new(Self {
            default: IdentityLocation::Owned(NodeId(node)),
            locations: Mutex::new(HashMap::new()),
        })
    }

    /// Every identity is unassigned unless overridden
    pub fn unassigned() -> Arc<Self> {
        Arc::new(Self {
            default: IdentityLocation::Unassigned,
            locations: Mutex::new(HashMap::new()),
        })
    }

    pub fn set(&self, identity: &str, location: IdentityLocation) {
        self.locations
            .lock()
            .unwrap()
            .insert(IdentityId::from(identity), location);
    }
}

impl IdentityOwnership for StaticOwnership {
    fn location(&self, identity: &IdentityId) -> IdentityLocation {
        self.locations
            .lock()
            .unwrap()
            .get(identity)
            .copied()
            .unwrap_or(self.default)
    }
}
