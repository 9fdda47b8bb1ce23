use std::collections::{BTreeMap, HashMap};
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::clock::{self, SharedClock};
use crate::error::{ExecutionError, Result};

use super::job::{DlqState, IntentId, Job, JobHandle, JobId, JobState};

/// Counts per job state at one instant.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDepth {
    pub queued: usize,
    pub leased: usize,
    pub completed: usize,
    pub dlq: usize,
}

impl QueueDepth {
    pub fn active(&self) -> usize {
        self.queued + self.leased
    }

    fn count(&mut self, state: JobState) {
        match state {
            JobState::Queued => self.queued += 1,
            JobState::Leased => self.leased += 1,
            JobState::Completed => self.completed += 1,
            JobState::Dlq => self.dlq += 1,
        }
    }
}

/// Durable leased work queue consumed by execution workers.
///
/// Every mutation that requires a lease checks that `worker_id` is the
/// current holder and fails with [`ExecutionError::LeaseMismatch`]
/// otherwise.
#[async_trait]
pub trait ExecutionQueue: Send + Sync {
    /// Returns the handle of the active job for the intent, creating one
    /// only when no queued or leased job exists.
    async fn enqueue(&self, job: Job) -> Result<JobHandle>;

    /// Leases up to `batch` eligible jobs, highest priority first, then
    /// oldest first. Each leased job has its attempt count incremented.
    async fn lease(
        &self,
        worker_id: &str,
        batch: usize,
        visibility_timeout: Duration,
    ) -> Result<Vec<Job>>;

    /// Extends the lease; returns the new expiry.
    async fn heartbeat(
        &self,
        job_id: JobId,
        worker_id: &str,
        visibility_timeout: Duration,
    ) -> Result<DateTime<Utc>>;

    async fn ack_success(&self, job_id: JobId, worker_id: &str) -> Result<()>;

    /// Returns a leased job to the queue. `decrement_attempt` undoes the
    /// increment applied by `lease` for deferrals that never reached the
    /// adapter.
    async fn release(
        &self,
        job_id: JobId,
        worker_id: &str,
        available_at: DateTime<Utc>,
        reason: &str,
        decrement_attempt: bool,
    ) -> Result<()>;

    async fn move_to_dlq(
        &self,
        job_id: JobId,
        worker_id: &str,
        dlq_state: DlqState,
        reason: &str,
    ) -> Result<()>;

    /// Requeues every leased job whose lease has expired, leaving its
    /// attempt count unchanged. Returns the number reclaimed.
    async fn reclaim_expired(&self) -> Result<u64>;

    /// Deletes completed jobs last updated before `older_than`. Returns the
    /// number removed.
    async fn prune_completed(&self, older_than: DateTime<Utc>) -> Result<u64>;

    async fn get(&self, job_id: JobId) -> Result<Option<Job>>;

    /// Dead-lettered jobs, most recently updated first.
    async fn list_dlq(&self, limit: usize) -> Result<Vec<Job>>;

    async fn depth(&self) -> Result<QueueDepth>;

    /// Active (queued or leased) jobs per context key.
    async fn depth_by_context(&self) -> Result<BTreeMap<String, usize>>;

    async fn replay_dlq(&self, job_id: JobId, actor: &str) -> Result<JobHandle>;

    /// Closes a DLQ entry. Only `terminal` and `resolved` are accepted.
    async fn resolve_dlq(&self, job_id: JobId, actor: &str, state: DlqState) -> Result<Job>;
}

/// Only entries still awaiting an operator can be replayed.
pub(crate) fn ensure_replayable(job_id: JobId, dlq_state: Option<DlqState>) -> Result<()> {
    match dlq_state {
        Some(DlqState::AwaitingManualAction) => Ok(()),
        other => Err(ExecutionError::InvalidTransition(format!(
            "job {job_id} dlq entry is {}, replay not permitted",
            other.map(|s| s.as_str()).unwrap_or("unset")
        ))),
    }
}

pub(crate) fn ensure_resolution_state(state: DlqState) -> Result<()> {
    match state {
        DlqState::Terminal | DlqState::Resolved => Ok(()),
        other => Err(ExecutionError::InvalidTransition(format!(
            "dlq entries can only be resolved as terminal or resolved, not {other}"
        ))),
    }
}

#[derive(Default)]
struct QueueState {
    jobs: HashMap<JobId, Job>,
    active_by_intent: HashMap<IntentId, JobId>,
}

impl QueueState {
    fn leased_mut(&mut self, job_id: JobId, worker_id: &str) -> Result<&mut Job> {
        let job = self
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| ExecutionError::NotFound(format!("job {job_id}")))?;
        if !job.is_leased_by(worker_id) {
            return Err(ExecutionError::LeaseMismatch(format!(
                "job {job_id} is {} and leased by {:?}, not {worker_id}",
                job.state, job.leased_by
            )));
        }
        Ok(job)
    }

    fn dlq_mut(&mut self, job_id: JobId) -> Result<&mut Job> {
        let job = self
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| ExecutionError::NotFound(format!("job {job_id}")))?;
        if job.state != JobState::Dlq {
            return Err(ExecutionError::InvalidTransition(format!(
                "job {job_id} is {}, not in the dlq",
                job.state
            )));
        }
        Ok(job)
    }

    fn settle(&mut self, job_id: JobId) {
        if let Some(job) = self.jobs.get(&job_id) {
            let intent = job.intent.intent_id.clone();
            if self.active_by_intent.get(&intent) == Some(&job_id) {
                self.active_by_intent.remove(&intent);
            }
        }
    }
}

/// Mutex-guarded queue. Selection and mutation happen under one lock, so
/// concurrent `lease` calls never hand out the same job.
pub struct InMemoryExecutionQueue {
    state: Mutex<QueueState>,
    clock: SharedClock,
}

impl fmt::Debug for InMemoryExecutionQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("InMemoryExecutionQueue")
            .field("jobs", &state.jobs.len())
            .field("active", &state.active_by_intent.len())
            .finish()
    }
}

impl InMemoryExecutionQueue {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            clock,
        }
    }
}

#[async_trait]
impl ExecutionQueue for InMemoryExecutionQueue {
    async fn enqueue(&self, mut job: Job) -> Result<JobHandle> {
        job.validate()?;
        if job.state != JobState::Queued {
            return Err(ExecutionError::Validation(format!(
                "job {} must be enqueued in the queued state, found {}",
                job.id, job.state
            )));
        }

        let mut state = self.state.lock();
        let intent = job.intent.intent_id.clone();
        if let Some(existing) = state.active_by_intent.get(&intent).copied() {
            debug!(job = %existing, intent = %intent, "enqueue merged into active job");
            return Ok(JobHandle::merged(existing, intent));
        }

        job.leased_by = None;
        job.lease_until = None;
        job.updated_at = self.clock.now();
        let handle = JobHandle::accepted(&job);
        state.active_by_intent.insert(intent, job.id);
        info!(job = %job.id, intent = %job.intent.intent_id, priority = job.priority, "job enqueued");
        state.jobs.insert(job.id, job);
        Ok(handle)
    }

    async fn lease(
        &self,
        worker_id: &str,
        batch: usize,
        visibility_timeout: Duration,
    ) -> Result<Vec<Job>> {
        if batch == 0 {
            return Ok(Vec::new());
        }
        let now = self.clock.now();
        let mut state = self.state.lock();

        let mut eligible: Vec<(f64, DateTime<Utc>, JobId)> = state
            .jobs
            .values()
            .filter(|job| job.state == JobState::Queued && job.available_at <= now)
            .map(|job| (job.priority, job.created_at, job.id))
            .collect();
        eligible.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.1.cmp(&b.1)).then(a.2.cmp(&b.2)));

        let mut leased = Vec::with_capacity(batch.min(eligible.len()));
        for (_, _, id) in eligible.into_iter().take(batch) {
            if let Some(job) = state.jobs.get_mut(&id) {
                job.state = JobState::Leased;
                job.leased_by = Some(worker_id.to_string());
                job.lease_until = Some(clock::saturating_add(now, visibility_timeout));
                job.attempt_count += 1;
                job.updated_at = now;
                leased.push(job.clone());
            }
        }
        Ok(leased)
    }

    async fn heartbeat(
        &self,
        job_id: JobId,
        worker_id: &str,
        visibility_timeout: Duration,
    ) -> Result<DateTime<Utc>> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let job = state.leased_mut(job_id, worker_id)?;
        let until = clock::saturating_add(now, visibility_timeout);
        job.lease_until = Some(until);
        job.updated_at = now;
        Ok(until)
    }

    async fn ack_success(&self, job_id: JobId, worker_id: &str) -> Result<()> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let job = state.leased_mut(job_id, worker_id)?;
        job.state = JobState::Completed;
        job.leased_by = None;
        job.lease_until = None;
        job.updated_at = now;
        state.settle(job_id);
        Ok(())
    }

    async fn release(
        &self,
        job_id: JobId,
        worker_id: &str,
        available_at: DateTime<Utc>,
        reason: &str,
        decrement_attempt: bool,
    ) -> Result<()> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let job = state.leased_mut(job_id, worker_id)?;
        job.state = JobState::Queued;
        job.leased_by = None;
        job.lease_until = None;
        job.available_at = available_at;
        job.last_error = Some(reason.to_string());
        if decrement_attempt {
            job.attempt_count = job.attempt_count.saturating_sub(1);
        }
        job.updated_at = now;
        Ok(())
    }

    async fn move_to_dlq(
        &self,
        job_id: JobId,
        worker_id: &str,
        dlq_state: DlqState,
        reason: &str,
    ) -> Result<()> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let job = state.leased_mut(job_id, worker_id)?;
        job.state = JobState::Dlq;
        job.dlq_state = Some(dlq_state);
        job.leased_by = None;
        job.lease_until = None;
        job.last_error = Some(reason.to_string());
        job.updated_at = now;
        warn!(job = %job_id, attempts = job.attempt_count, dlq_state = %dlq_state, reason, "job moved to dlq");
        state.settle(job_id);
        Ok(())
    }

    async fn reclaim_expired(&self) -> Result<u64> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let mut reclaimed = 0u64;
        for job in state.jobs.values_mut() {
            if job.state == JobState::Leased && job.lease_until.is_some_and(|until| until <= now) {
                warn!(job = %job.id, worker = ?job.leased_by, "lease expired; requeueing");
                job.state = JobState::Queued;
                job.leased_by = None;
                job.lease_until = None;
                job.available_at = now;
                job.updated_at = now;
                reclaimed += 1;
            }
        }
        Ok(reclaimed)
    }

    async fn prune_completed(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let mut state = self.state.lock();
        let before = state.jobs.len();
        state
            .jobs
            .retain(|_, job| !(job.state == JobState::Completed && job.updated_at < older_than));
        let pruned = (before - state.jobs.len()) as u64;
        if pruned > 0 {
            debug!(pruned, "completed jobs pruned");
        }
        Ok(pruned)
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>> {
        Ok(self.state.lock().jobs.get(&job_id).cloned())
    }

    async fn list_dlq(&self, limit: usize) -> Result<Vec<Job>> {
        let state = self.state.lock();
        let mut dlq: Vec<Job> = state
            .jobs
            .values()
            .filter(|job| job.state == JobState::Dlq)
            .cloned()
            .collect();
        dlq.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        dlq.truncate(limit);
        Ok(dlq)
    }

    async fn depth(&self) -> Result<QueueDepth> {
        let state = self.state.lock();
        let mut depth = QueueDepth::default();
        for job in state.jobs.values() {
            depth.count(job.state);
        }
        Ok(depth)
    }

    async fn depth_by_context(&self) -> Result<BTreeMap<String, usize>> {
        let state = self.state.lock();
        let mut out = BTreeMap::new();
        for job in state.jobs.values().filter(|job| job.is_active()) {
            *out.entry(job.context_key.clone()).or_insert(0) += 1;
        }
        Ok(out)
    }

    async fn replay_dlq(&self, job_id: JobId, actor: &str) -> Result<JobHandle> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let original = state.dlq_mut(job_id)?;
        let dlq_state = original.dlq_state;
        let intent = original.intent.intent_id.clone();

        if dlq_state == Some(DlqState::Replayed) {
            let child = state
                .active_by_intent
                .get(&intent)
                .copied()
                .filter(|active| {
                    state
                        .jobs
                        .get(active)
                        .is_some_and(|job| job.parent_job_id == Some(job_id))
                });
            if let Some(child) = child {
                debug!(job = %job_id, child = %child, actor, "dlq entry already replayed");
                return Ok(JobHandle::merged(child, intent));
            }
        }
        ensure_replayable(job_id, dlq_state)?;

        if let Some(active) = state.active_by_intent.get(&intent).copied() {
            if let Some(original) = state.jobs.get_mut(&job_id) {
                original.dlq_state = Some(DlqState::Replayed);
                original.updated_at = now;
            }
            info!(job = %job_id, active = %active, actor, "dlq replay merged into active job");
            return Ok(JobHandle::merged(active, intent));
        }

        let original = state.dlq_mut(job_id)?;
        original.dlq_state = Some(DlqState::Replayed);
        original.updated_at = now;
        let child = original.replay_child(now);

        let handle = JobHandle::accepted(&child);
        info!(
            job = %job_id,
            child = %child.id,
            version = child.job_version,
            actor,
            "dlq job replayed"
        );
        state.active_by_intent.insert(intent, child.id);
        state.jobs.insert(child.id, child);
        Ok(handle)
    }

    async fn resolve_dlq(&self, job_id: JobId, actor: &str, resolution: DlqState) -> Result<Job> {
        ensure_resolution_state(resolution)?;
        let now = self.clock.now();
        let mut state = self.state.lock();
        let job = state.dlq_mut(job_id)?;
        if job.dlq_state.is_some_and(|s| s.is_closed()) {
            return Err(ExecutionError::InvalidTransition(format!(
                "job {job_id} dlq entry already closed as {}",
                job.dlq_state.map(|s| s.as_str()).unwrap_or("unset")
            )));
        }
        job.dlq_state = Some(resolution);
        job.updated_at = now;
        info!(job = %job_id, actor, resolution = %resolution, "dlq job resolved");
        Ok(job.clone())
    }
}
