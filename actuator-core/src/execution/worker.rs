//! Per-job execution pipeline.
//!
//! A leased job passes the admission gates in a fixed order (adaptive pacing,
//! circuit breaker, rate limiter, idempotency) before the adapter is called.
//! Gate deferrals hand the lease back without spending an attempt. Every
//! path that takes a job out of the queued/leased states publishes exactly
//! one result envelope.

use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use futures::FutureExt;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::clock::{self, SharedClock};
use crate::error::Result;

use super::adapter::{AdapterRegistry, ContentMaterializer};
use super::adaptive::AdaptiveRateController;
use super::circuit::{Admission, CircuitBreaker};
use super::config::ExecutionConfig;
use super::events::{
    DeferralReason, ExecutionEvent, ExecutionEventPayload, ExecutionEventPublisher,
    InProcExecutionEventBus,
};
use super::heartbeat::{HeartbeatStore, InMemoryHeartbeatStore};
use super::idempotency::{BeginOutcome, IdempotencyStore, InMemoryIdempotencyStore};
use super::inbox::{InMemoryResultInbox, ResultInbox};
use super::job::{DlqState, Intent, Job};
use super::queue::{ExecutionQueue, InMemoryExecutionQueue};
use super::rate_limit::SlidingWindowRateLimiter;
use super::result::{ExecutionResult, ResultEnvelope};
use super::retry::RetryScheduler;

/// Shared collaborators handed to every worker, the dispatcher and the
/// supervisor. Cloning is cheap.
#[derive(Clone)]
pub struct WorkerContext {
    pub config: Arc<ExecutionConfig>,
    pub queue: Arc<dyn ExecutionQueue>,
    pub inbox: Arc<dyn ResultInbox>,
    pub idempotency: Arc<dyn IdempotencyStore>,
    pub heartbeats: Arc<dyn HeartbeatStore>,
    pub circuit: Arc<CircuitBreaker>,
    pub rate_limiter: Arc<SlidingWindowRateLimiter>,
    pub adaptive: Arc<AdaptiveRateController>,
    pub retry: RetryScheduler,
    pub adapters: AdapterRegistry,
    pub materializer: Option<Arc<dyn ContentMaterializer>>,
    pub events: Arc<dyn ExecutionEventPublisher>,
    /// Woken after every published result so the dispatcher need not wait
    /// for its poll interval.
    pub result_notify: Arc<Notify>,
    pub clock: SharedClock,
}

impl fmt::Debug for WorkerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerContext")
            .field("adapters", &self.adapters)
            .field("circuit", &self.circuit)
            .field("rate_limiter", &self.rate_limiter)
            .field("materializer", &self.materializer.is_some())
            .finish()
    }
}

impl WorkerContext {
    /// Context backed entirely by in-memory stores.
    pub fn in_memory(config: ExecutionConfig, adapters: AdapterRegistry, clock: SharedClock) -> Self {
        let stale_after = clock::seconds(config.idempotency.stale_after_secs);
        Self {
            queue: Arc::new(InMemoryExecutionQueue::new(clock.clone())),
            inbox: Arc::new(InMemoryResultInbox::new(clock.clone())),
            idempotency: Arc::new(InMemoryIdempotencyStore::new(stale_after, clock.clone())),
            heartbeats: Arc::new(InMemoryHeartbeatStore::new(clock.clone())),
            circuit: Arc::new(CircuitBreaker::new(config.circuit, clock.clone())),
            rate_limiter: Arc::new(SlidingWindowRateLimiter::new(config.rate_limit.clone())),
            adaptive: Arc::new(AdaptiveRateController::new(config.adaptive.clone())),
            retry: RetryScheduler::new(config.retry),
            adapters,
            materializer: None,
            events: Arc::new(InProcExecutionEventBus::default()),
            result_notify: Arc::new(Notify::new()),
            config: Arc::new(config),
            clock,
        }
    }

    pub(crate) async fn emit(&self, payload: ExecutionEventPayload) {
        let event = ExecutionEvent::new(self.clock.now(), payload);
        if let Err(err) = self.events.publish(event).await {
            debug!(error = %err, "execution event dropped");
        }
    }
}

/// What happened to one leased job.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JobOutcome {
    /// Acknowledged with a terminal result (success or non-retryable).
    Completed,
    /// Released with a backoff after an environment failure.
    Retried,
    DeadLettered,
    /// Handed back by an admission gate without spending an attempt.
    Deferred(DeferralReason),
    /// Idempotency record was already done; acknowledged without executing.
    Duplicate,
    /// The lease could not be renewed before execution.
    LeaseLost,
}

/// Circuit admission held by one job. A half-open trial slot that is
/// dropped without an outcome is handed back to the breaker.
struct CircuitPermit {
    circuit: Arc<CircuitBreaker>,
    route: String,
    admission: Admission,
    settled: bool,
}

impl CircuitPermit {
    fn acquire(circuit: &Arc<CircuitBreaker>, route: &str) -> Option<Self> {
        let admission = circuit.admit(route);
        admission.is_admitted().then(|| Self {
            circuit: Arc::clone(circuit),
            route: route.to_string(),
            admission,
            settled: false,
        })
    }

    fn record_success(mut self) {
        self.settled = true;
        self.circuit.record_success(&self.route);
    }

    fn record_failure(mut self) {
        self.settled = true;
        self.circuit.record_failure(&self.route);
    }
}

impl Drop for CircuitPermit {
    fn drop(&mut self) {
        if !self.settled && self.admission == Admission::Trial {
            debug!(route = %self.route, "half-open slot returned unused");
            self.circuit.cancel_trial(&self.route);
        }
    }
}

/// Rate-limit slot taken at `at`. Refunded on drop unless the adapter call
/// was actually made.
struct RateSlot {
    limiter: Arc<SlidingWindowRateLimiter>,
    route: String,
    at: DateTime<Utc>,
    spent: bool,
}

impl RateSlot {
    fn new(limiter: &Arc<SlidingWindowRateLimiter>, route: &str, at: DateTime<Utc>) -> Self {
        Self {
            limiter: Arc::clone(limiter),
            route: route.to_string(),
            at,
            spent: false,
        }
    }

    fn spend(mut self) {
        self.spent = true;
    }
}

impl Drop for RateSlot {
    fn drop(&mut self) {
        if !self.spent {
            self.limiter.refund(&self.route, self.at);
        }
    }
}

pub struct ExecutionWorker {
    worker_id: String,
    ctx: WorkerContext,
}

impl fmt::Debug for ExecutionWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionWorker")
            .field("worker_id", &self.worker_id)
            .finish()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

impl ExecutionWorker {
    pub fn new(worker_id: impl Into<String>, ctx: WorkerContext) -> Self {
        Self {
            worker_id: worker_id.into(),
            ctx,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn visibility_timeout(&self) -> Duration {
        self.ctx.config.lease.visibility_timeout()
    }

    /// Leases one batch and runs every job through the pipeline. Returns the
    /// number of jobs leased. Heartbeat failures are logged and never stop
    /// an already leased batch.
    pub async fn run_once(&self) -> Result<usize> {
        self.beat("polling").await;
        let jobs = self
            .ctx
            .queue
            .lease(
                &self.worker_id,
                self.ctx.config.lease.batch_size,
                self.visibility_timeout(),
            )
            .await?;
        let leased = jobs.len();

        for job in jobs {
            self.beat("executing").await;
            self.ctx
                .emit(ExecutionEventPayload::Leased {
                    job_id: job.id,
                    worker_id: self.worker_id.clone(),
                    attempt: job.attempt_count,
                })
                .await;
            let job_id = job.id;
            match self.process(job).await {
                Ok(outcome) => debug!(job = %job_id, ?outcome, "job processed"),
                Err(err) if err.is_lease_conflict() => {
                    warn!(job = %job_id, error = %err, "lease lost while processing job");
                }
                Err(err) => error!(job = %job_id, error = %err, "job processing failed"),
            }
        }
        Ok(leased)
    }

    async fn beat(&self, status: &str) {
        if let Err(err) = self.ctx.heartbeats.beat(&self.worker_id, status).await {
            warn!(status, error = %err, "worker heartbeat failed");
        }
    }

    /// Intake loop. Cancellation stops the loop between cycles and never
    /// interrupts an in-flight adapter call.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let span = info_span!("execution_worker", worker = %self.worker_id);
        async move {
            info!("worker started");
            let idle = self.ctx.config.lease.idle_poll();
            let backoff = std::time::Duration::from_millis(self.ctx.config.lease.error_backoff_ms);
            while !shutdown.is_cancelled() {
                let pause = match self.run_once().await {
                    Ok(0) => Some(idle),
                    Ok(_) => None,
                    Err(err) => {
                        warn!(error = %err, "worker cycle failed");
                        Some(backoff)
                    }
                };
                if let Some(pause) = pause {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(pause) => {}
                    }
                }
            }
            if let Err(err) = self.ctx.heartbeats.beat(&self.worker_id, "stopped").await {
                debug!(error = %err, "final heartbeat failed");
            }
            info!("worker stopped");
        }
        .instrument(span)
        .await
    }

    pub async fn process(&self, job: Job) -> Result<JobOutcome> {
        let ctx = &self.ctx;
        let route = job.route_key();
        let now = ctx.clock.now();

        let lag = (now - job.available_at).max(Duration::zero());
        let wait = ctx.adaptive.pre_send_delay(&route, lag, now);
        if wait > Duration::zero() {
            let at = clock::saturating_add(now, wait);
            return self.defer(&job, DeferralReason::AdaptiveThrottle, at).await;
        }

        let Some(permit) = CircuitPermit::acquire(&ctx.circuit, &route) else {
            let at = clock::saturating_add(now, clock::millis(ctx.config.circuit.deferral_ms));
            return self.defer(&job, DeferralReason::CircuitOpen, at).await;
        };

        let decision = ctx.rate_limiter.allow(&route, now);
        if !decision.allowed {
            drop(permit);
            let wait = clock::millis((decision.retry_after_secs * 1_000.0).ceil() as u64);
            return self
                .defer(&job, DeferralReason::RateLimited, clock::saturating_add(now, wait))
                .await;
        }
        let slot = RateSlot::new(&ctx.rate_limiter, &route, now);

        let key = job.idempotency_key();
        match ctx.idempotency.begin(&key).await? {
            BeginOutcome::New => {}
            BeginOutcome::Done(record) => {
                drop((permit, slot));
                ctx.queue.ack_success(job.id, &self.worker_id).await?;
                let result = serde_json::from_value::<ExecutionResult>(record.metadata)
                    .unwrap_or_else(|_| ExecutionResult::success());
                info!(job = %job.id, "idempotency record done; acknowledged without executing");
                self.publish(&job, result).await?;
                return Ok(JobOutcome::Duplicate);
            }
            BeginOutcome::InProgress { stale: false, .. } => {
                drop((permit, slot));
                let at = clock::saturating_add(
                    now,
                    clock::millis(ctx.config.idempotency.in_progress_deferral_ms),
                );
                return self.defer(&job, DeferralReason::InProgress, at).await;
            }
            BeginOutcome::InProgress { stale: true, since } => {
                drop((permit, slot));
                let reason = format!("unknown outcome: attempt in progress since {since}");
                ctx.queue
                    .move_to_dlq(job.id, &self.worker_id, DlqState::AwaitingManualAction, &reason)
                    .await?;
                self.dead_lettered(&job, DlqState::AwaitingManualAction, &reason).await;
                self.publish(&job, ExecutionResult::internal(reason)).await?;
                return Ok(JobOutcome::DeadLettered);
            }
        }

        let intent = self.materialize(&job.intent).await;

        if let Err(err) = ctx
            .queue
            .heartbeat(job.id, &self.worker_id, self.visibility_timeout())
            .await
        {
            warn!(job = %job.id, error = %err, "lease renewal failed before execution; abandoning");
            drop((permit, slot));
            ctx.idempotency.clear_in_progress(&key).await?;
            return Ok(JobOutcome::LeaseLost);
        }

        slot.spend();
        ctx.adaptive.record_send(&route, ctx.clock.now());
        let result = self.execute_guarded(&intent).await;

        if let Err(err) = ctx
            .queue
            .heartbeat(job.id, &self.worker_id, self.visibility_timeout())
            .await
        {
            warn!(job = %job.id, error = %err, "lease renewal failed after execution");
        }

        self.handle_result(&job, permit, &key, result).await
    }

    /// Circuit and pacing feedback is recorded before any store call so a
    /// failing store cannot strand the route's half-open slot.
    async fn handle_result(
        &self,
        job: &Job,
        permit: CircuitPermit,
        key: &str,
        result: ExecutionResult,
    ) -> Result<JobOutcome> {
        let ctx = &self.ctx;
        let route = permit.route.clone();

        if result.is_success() {
            permit.record_success();
            ctx.adaptive.record_success(&route);
            ctx.idempotency
                .complete(key, serde_json::to_value(&result)?)
                .await?;
            if let Err(err) = ctx.queue.ack_success(job.id, &self.worker_id).await {
                warn!(job = %job.id, error = %err, "ack after successful execution failed");
            }
            self.publish(job, result).await?;
            return Ok(JobOutcome::Completed);
        }

        if result.is_environment_failure() {
            permit.record_failure();
            ctx.adaptive.record_failure(&route, &result);
            ctx.idempotency.clear_in_progress(key).await?;
            let reason = result.reason_or_default();

            if ctx.retry.should_retry(job.attempt_count, job.max_attempts) {
                let at = ctx.retry.next_retry_at(job.attempt_count, ctx.clock.now());
                ctx.queue
                    .release(job.id, &self.worker_id, at, &reason, false)
                    .await?;
                warn!(
                    job = %job.id,
                    attempt = job.attempt_count,
                    max_attempts = job.max_attempts,
                    retry_at = %at,
                    reason = %reason,
                    "environment failure; retry scheduled"
                );
                ctx.emit(ExecutionEventPayload::Retried {
                    job_id: job.id,
                    attempt: job.attempt_count,
                    available_at: at,
                })
                .await;
                return Ok(JobOutcome::Retried);
            }

            ctx.queue
                .move_to_dlq(job.id, &self.worker_id, DlqState::AwaitingManualAction, &reason)
                .await?;
            self.dead_lettered(job, DlqState::AwaitingManualAction, &reason).await;
            self.publish(job, result).await?;
            return Ok(JobOutcome::DeadLettered);
        }

        drop(permit);
        ctx.idempotency.clear_in_progress(key).await?;
        ctx.queue.ack_success(job.id, &self.worker_id).await?;
        info!(
            job = %job.id,
            status = ?result.status,
            failure_type = %result.failure_type,
            "terminal failure; not retried"
        );
        self.publish(job, result).await?;
        Ok(JobOutcome::Completed)
    }

    async fn defer(
        &self,
        job: &Job,
        reason: DeferralReason,
        available_at: DateTime<Utc>,
    ) -> Result<JobOutcome> {
        self.ctx
            .queue
            .release(job.id, &self.worker_id, available_at, &reason.to_string(), true)
            .await?;
        debug!(job = %job.id, %reason, available_at = %available_at, "job deferred");
        self.ctx
            .emit(ExecutionEventPayload::Deferred {
                job_id: job.id,
                reason,
                available_at,
            })
            .await;
        Ok(JobOutcome::Deferred(reason))
    }

    async fn materialize(&self, intent: &Intent) -> Intent {
        let Some(materializer) = self.ctx.materializer.as_ref() else {
            return intent.clone();
        };
        let mut out = intent.clone();
        match materializer.materialize(intent).await {
            Ok(payload) => out.payload = payload,
            Err(err) => match intent.fallback_payload.clone() {
                Some(fallback) => {
                    warn!(intent = %intent.intent_id, error = %err, "materialization failed; using fallback payload");
                    out.payload = fallback;
                }
                None => {
                    warn!(intent = %intent.intent_id, error = %err, "materialization failed; no fallback, using original payload");
                }
            },
        }
        out
    }

    /// Runs the adapter, turning a missing adapter, an adapter error or a
    /// panic into an internal failure.
    async fn execute_guarded(&self, intent: &Intent) -> ExecutionResult {
        let Some(adapter) = self.ctx.adapters.get(&intent.platform) else {
            return ExecutionResult::internal(format!(
                "no adapter registered for platform {}",
                intent.platform
            ));
        };

        match AssertUnwindSafe(adapter.execute(intent)).catch_unwind().await {
            Ok(Ok(result)) => result,
            Ok(Err(err)) => ExecutionResult::internal(format!("adapter error: {err}")),
            Err(panic) => {
                let msg = panic_message(panic.as_ref());
                error!(intent = %intent.intent_id, panic = %msg, "adapter panicked");
                ExecutionResult::internal(format!("adapter panicked: {msg}"))
            }
        }
    }

    async fn dead_lettered(&self, job: &Job, dlq_state: DlqState, reason: &str) {
        self.ctx
            .emit(ExecutionEventPayload::DeadLettered {
                job_id: job.id,
                dlq_state,
                reason: reason.to_string(),
            })
            .await;
    }

    async fn publish(&self, job: &Job, result: ExecutionResult) -> Result<()> {
        let failure_type = result.failure_type;
        let envelope = ResultEnvelope::for_job(job, result, self.ctx.clock.now());
        if self.ctx.inbox.append(envelope).await? {
            self.ctx.result_notify.notify_one();
        }
        self.ctx
            .emit(ExecutionEventPayload::Completed {
                job_id: job.id,
                failure_type,
            })
            .await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::{Value, json};

    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::execution::adapter::{AdapterError, ExecutionAdapter};
    use crate::execution::circuit::CircuitState;
    use crate::execution::config::{RateLimitConfig, WindowLimit};
    use crate::execution::idempotency::IdempotencyState;
    use crate::execution::job::JobState;

    /// Returns scripted results in order, then successes.
    #[derive(Default)]
    struct Scripted {
        results: Mutex<VecDeque<ExecutionResult>>,
        calls: AtomicUsize,
        seen_payloads: Mutex<Vec<Value>>,
    }

    impl Scripted {
        fn with(results: Vec<ExecutionResult>) -> Arc<Self> {
            Arc::new(Self {
                results: Mutex::new(results.into()),
                ..Self::default()
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ExecutionAdapter for Scripted {
        async fn execute(&self, intent: &Intent) -> std::result::Result<ExecutionResult, AdapterError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen_payloads.lock().push(intent.payload.clone());
            Ok(self
                .results
                .lock()
                .pop_front()
                .unwrap_or_else(ExecutionResult::success))
        }
    }

    struct Panicking;

    #[async_trait]
    impl ExecutionAdapter for Panicking {
        async fn execute(&self, _intent: &Intent) -> std::result::Result<ExecutionResult, AdapterError> {
            panic!("adapter blew up");
        }
    }

    struct FailingMaterializer;

    #[async_trait]
    impl ContentMaterializer for FailingMaterializer {
        async fn materialize(&self, _intent: &Intent) -> std::result::Result<Value, AdapterError> {
            Err(AdapterError::Other("render failed".into()))
        }
    }

    /// Delegates to the in-memory store but fails the first `complete`.
    struct FlakyComplete {
        inner: InMemoryIdempotencyStore,
        failed: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl IdempotencyStore for FlakyComplete {
        async fn begin(&self, key: &str) -> Result<BeginOutcome> {
            self.inner.begin(key).await
        }

        async fn complete(&self, key: &str, metadata: Value) -> Result<()> {
            if !self.failed.swap(true, Ordering::SeqCst) {
                return Err(crate::ExecutionError::Internal("idempotency store offline".into()));
            }
            self.inner.complete(key, metadata).await
        }

        async fn clear_in_progress(&self, key: &str) -> Result<()> {
            self.inner.clear_in_progress(key).await
        }

        async fn get(&self, key: &str) -> Result<Option<crate::execution::idempotency::IdempotencyRecord>> {
            self.inner.get(key).await
        }
    }

    struct OfflineHeartbeats;

    #[async_trait]
    impl HeartbeatStore for OfflineHeartbeats {
        async fn beat(&self, _worker_id: &str, _status: &str) -> Result<()> {
            Err(crate::ExecutionError::Internal("heartbeat store offline".into()))
        }

        async fn get(&self, _worker_id: &str) -> Result<Option<crate::execution::heartbeat::WorkerHeartbeat>> {
            Ok(None)
        }

        async fn list(&self) -> Result<Vec<crate::execution::heartbeat::WorkerHeartbeat>> {
            Ok(Vec::new())
        }
    }

    fn config() -> ExecutionConfig {
        let mut cfg = ExecutionConfig::default();
        cfg.rate_limit = RateLimitConfig {
            global: None,
            per_route: None,
            route_overrides: Default::default(),
        };
        cfg
    }

    fn fixture(cfg: ExecutionConfig, adapter: Arc<dyn ExecutionAdapter>) -> (ExecutionWorker, ManualClock) {
        let clock = ManualClock::default();
        let adapters = AdapterRegistry::new().with_adapter("x", adapter);
        let ctx = WorkerContext::in_memory(cfg, adapters, Arc::new(clock.clone()));
        (ExecutionWorker::new("w-1", ctx), clock)
    }

    async fn lease_one(worker: &ExecutionWorker, intent: &str, max_attempts: u32) -> Job {
        let job = Job::new(Intent::new(intent, "x", "acct", "post"), worker.ctx.clock.now())
            .with_max_attempts(max_attempts);
        worker.ctx.queue.enqueue(job).await.unwrap();
        worker
            .ctx
            .queue
            .lease("w-1", 1, worker.visibility_timeout())
            .await
            .unwrap()
            .pop()
            .unwrap()
    }

    #[tokio::test]
    async fn success_acks_completes_idempotency_and_publishes_once() {
        let adapter = Scripted::with(vec![]);
        let (worker, _) = fixture(config(), adapter.clone());
        let job = lease_one(&worker, "i-1", 3).await;

        let outcome = worker.process(job.clone()).await.unwrap();
        assert_eq!(outcome, JobOutcome::Completed);
        assert_eq!(adapter.calls(), 1);

        let stored = worker.ctx.queue.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Completed);
        let record = worker.ctx.idempotency.get(&job.idempotency_key()).await.unwrap().unwrap();
        assert_eq!(record.state, IdempotencyState::Done);
        assert_eq!(worker.ctx.inbox.depth().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn environment_failure_retries_then_dead_letters() {
        let adapter = Scripted::with(vec![
            ExecutionResult::environment("connection reset"),
            ExecutionResult::environment("connection reset"),
        ]);
        let (worker, clock) = fixture(config(), adapter.clone());
        let job = lease_one(&worker, "i-1", 2).await;

        assert_eq!(worker.process(job.clone()).await.unwrap(), JobOutcome::Retried);
        let stored = worker.ctx.queue.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Queued);
        assert!(stored.available_at > clock.now());
        assert!(worker.ctx.idempotency.get(&job.idempotency_key()).await.unwrap().is_none());
        assert_eq!(worker.ctx.inbox.depth().await.unwrap(), 0);

        clock.advance(Duration::minutes(10));
        let again = worker
            .ctx
            .queue
            .lease("w-1", 1, worker.visibility_timeout())
            .await
            .unwrap()
            .pop()
            .unwrap();
        assert_eq!(again.attempt_count, 2);
        assert_eq!(worker.process(again).await.unwrap(), JobOutcome::DeadLettered);

        let stored = worker.ctx.queue.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Dlq);
        assert_eq!(stored.dlq_state, Some(DlqState::AwaitingManualAction));
        assert_eq!(stored.attempt_count, 2);
        assert_eq!(worker.ctx.inbox.depth().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn policy_rejection_is_terminal_without_retry() {
        let adapter = Scripted::with(vec![ExecutionResult::rejected("blocked by policy")]);
        let (worker, _) = fixture(config(), adapter.clone());
        let job = lease_one(&worker, "i-1", 5).await;

        assert_eq!(worker.process(job.clone()).await.unwrap(), JobOutcome::Completed);
        let stored = worker.ctx.queue.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Completed);
        assert!(worker.ctx.idempotency.get(&job.idempotency_key()).await.unwrap().is_none());
        assert_eq!(worker.ctx.inbox.depth().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn adapter_panic_becomes_internal_result() {
        let (worker, _) = fixture(config(), Arc::new(Panicking));
        let job = lease_one(&worker, "i-1", 5).await;

        assert_eq!(worker.process(job.clone()).await.unwrap(), JobOutcome::Completed);
        let stored = worker.ctx.queue.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Completed);
        assert_eq!(worker.ctx.inbox.depth().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn rate_limited_job_is_released_without_spending_an_attempt() {
        let mut cfg = config();
        cfg.rate_limit.per_route = Some(WindowLimit::new(1, 60));
        let adapter = Scripted::with(vec![]);
        let (worker, clock) = fixture(cfg, adapter.clone());

        let first = lease_one(&worker, "i-1", 5).await;
        worker.process(first).await.unwrap();

        let second = lease_one(&worker, "i-2", 5).await;
        let outcome = worker.process(second.clone()).await.unwrap();
        assert_eq!(outcome, JobOutcome::Deferred(DeferralReason::RateLimited));
        assert_eq!(adapter.calls(), 1);

        let stored = worker.ctx.queue.get(second.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Queued);
        assert_eq!(stored.attempt_count, 0);
        assert!(stored.available_at > clock.now());
    }

    #[tokio::test]
    async fn open_circuit_defers_until_cooldown() {
        let mut cfg = config();
        cfg.circuit.failure_threshold = 1;
        let adapter = Scripted::with(vec![ExecutionResult::environment("timeout")]);
        let (worker, _) = fixture(cfg, adapter.clone());

        let first = lease_one(&worker, "i-1", 5).await;
        assert_eq!(worker.process(first).await.unwrap(), JobOutcome::Retried);

        let second = lease_one(&worker, "i-2", 5).await;
        assert_eq!(
            worker.process(second.clone()).await.unwrap(),
            JobOutcome::Deferred(DeferralReason::CircuitOpen)
        );
        assert_eq!(adapter.calls(), 1);
        let stored = worker.ctx.queue.get(second.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Queued);
        assert_eq!(stored.attempt_count, 0);
    }

    #[tokio::test]
    async fn pressure_failure_paces_the_next_send_on_the_route() {
        let adapter = Scripted::with(vec![ExecutionResult::environment("HTTP 429 Too Many Requests")]);
        let (worker, clock) = fixture(config(), adapter.clone());

        let first = lease_one(&worker, "i-1", 5).await;
        assert_eq!(worker.process(first).await.unwrap(), JobOutcome::Retried);

        let second = lease_one(&worker, "i-2", 5).await;
        assert_eq!(
            worker.process(second.clone()).await.unwrap(),
            JobOutcome::Deferred(DeferralReason::AdaptiveThrottle)
        );
        assert_eq!(adapter.calls(), 1);
        let stored = worker.ctx.queue.get(second.id).await.unwrap().unwrap();
        assert_eq!(stored.attempt_count, 0);
        assert_eq!(stored.available_at, clock.now() + Duration::seconds(1));
    }

    #[tokio::test]
    async fn done_record_short_circuits_redelivery() {
        let adapter = Scripted::with(vec![]);
        let (worker, _) = fixture(config(), adapter.clone());
        let job = lease_one(&worker, "i-1", 5).await;
        worker
            .ctx
            .idempotency
            .complete(&job.idempotency_key(), json!({"status": "SUCCESS", "failure_type": "NONE"}))
            .await
            .unwrap();

        assert_eq!(worker.process(job.clone()).await.unwrap(), JobOutcome::Duplicate);
        assert_eq!(adapter.calls(), 0);
        let stored = worker.ctx.queue.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Completed);
        assert_eq!(worker.ctx.inbox.depth().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn fresh_in_progress_defers_and_stale_goes_to_dlq() {
        let adapter = Scripted::with(vec![]);
        let (worker, clock) = fixture(config(), adapter.clone());
        let job = lease_one(&worker, "i-1", 5).await;
        worker.ctx.idempotency.begin(&job.idempotency_key()).await.unwrap();

        assert_eq!(
            worker.process(job.clone()).await.unwrap(),
            JobOutcome::Deferred(DeferralReason::InProgress)
        );
        let deferred = worker.ctx.queue.get(job.id).await.unwrap().unwrap();
        assert_eq!(deferred.attempt_count, 0);

        clock.advance(Duration::hours(1));
        let again = worker
            .ctx
            .queue
            .lease("w-1", 1, worker.visibility_timeout())
            .await
            .unwrap()
            .pop()
            .unwrap();
        assert_eq!(worker.process(again).await.unwrap(), JobOutcome::DeadLettered);
        assert_eq!(adapter.calls(), 0);

        let stored = worker.ctx.queue.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.dlq_state, Some(DlqState::AwaitingManualAction));
        assert_eq!(stored.attempt_count, 1);
        assert!(stored.last_error.unwrap().contains("unknown outcome"));
        assert_eq!(worker.ctx.inbox.depth().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn materialization_failure_uses_fallback_payload() {
        let adapter = Scripted::with(vec![]);
        let clock = ManualClock::default();
        let adapters = AdapterRegistry::new().with_adapter("x", adapter.clone());
        let mut ctx = WorkerContext::in_memory(config(), adapters, Arc::new(clock.clone()));
        ctx.materializer = Some(Arc::new(FailingMaterializer));
        let worker = ExecutionWorker::new("w-1", ctx);

        let intent = Intent::new("i-1", "x", "acct", "post")
            .with_payload(json!({"text": "{{render}}"}))
            .with_fallback(json!({"text": "plain"}));
        worker.ctx.queue.enqueue(Job::new(intent, clock.now())).await.unwrap();
        worker.run_once().await.unwrap();

        assert_eq!(adapter.seen_payloads.lock().clone(), vec![json!({"text": "plain"})]);
    }

    #[tokio::test]
    async fn missing_adapter_is_an_internal_terminal_result() {
        let (worker, clock) = fixture(config(), Scripted::with(vec![]));
        let job = Job::new(Intent::new("i-1", "unknown", "acct", "post"), clock.now());
        worker.ctx.queue.enqueue(job.clone()).await.unwrap();
        assert_eq!(worker.run_once().await.unwrap(), 1);

        let stored = worker.ctx.queue.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Completed);
        let beat = worker.ctx.heartbeats.get("w-1").await.unwrap().unwrap();
        assert_eq!(beat.status, "executing");
    }

    #[tokio::test]
    async fn store_error_after_half_open_success_does_not_block_the_route() {
        let mut cfg = config();
        cfg.circuit.failure_threshold = 1;
        let adapter = Scripted::with(vec![ExecutionResult::environment("connection reset")]);
        let clock = ManualClock::default();
        let adapters = AdapterRegistry::new().with_adapter("x", adapter.clone());
        let mut ctx = WorkerContext::in_memory(cfg, adapters, Arc::new(clock.clone()));
        ctx.idempotency = Arc::new(FlakyComplete {
            inner: InMemoryIdempotencyStore::new(Duration::minutes(5), Arc::new(clock.clone())),
            failed: Default::default(),
        });
        let worker = ExecutionWorker::new("w-1", ctx);

        let first = lease_one(&worker, "i-1", 1).await;
        let route = first.route_key();
        assert_eq!(worker.process(first).await.unwrap(), JobOutcome::DeadLettered);
        assert_eq!(worker.ctx.circuit.state(&route), CircuitState::Open);

        clock.advance(Duration::seconds(61));
        let second = lease_one(&worker, "i-2", 5).await;
        assert!(worker.process(second).await.is_err());
        assert_eq!(adapter.calls(), 2);

        let third = lease_one(&worker, "i-3", 5).await;
        assert_eq!(worker.process(third).await.unwrap(), JobOutcome::Completed);
        assert_eq!(adapter.calls(), 3);
        assert_eq!(worker.ctx.circuit.state(&route), CircuitState::Closed);
    }

    #[tokio::test]
    async fn in_progress_deferral_leaves_the_rate_slot_free() {
        let mut cfg = config();
        cfg.rate_limit.per_route = Some(WindowLimit::new(1, 60));
        let adapter = Scripted::with(vec![]);
        let (worker, _) = fixture(cfg, adapter.clone());

        let first = lease_one(&worker, "i-1", 5).await;
        worker.ctx.idempotency.begin(&first.idempotency_key()).await.unwrap();
        assert_eq!(
            worker.process(first).await.unwrap(),
            JobOutcome::Deferred(DeferralReason::InProgress)
        );

        let second = lease_one(&worker, "i-2", 5).await;
        assert_eq!(worker.process(second).await.unwrap(), JobOutcome::Completed);
        assert_eq!(adapter.calls(), 1);
    }

    #[tokio::test]
    async fn heartbeat_store_outage_does_not_drop_the_batch() {
        let adapter = Scripted::with(vec![]);
        let clock = ManualClock::default();
        let adapters = AdapterRegistry::new().with_adapter("x", adapter.clone());
        let mut ctx = WorkerContext::in_memory(config(), adapters, Arc::new(clock.clone()));
        ctx.heartbeats = Arc::new(OfflineHeartbeats);
        let worker = ExecutionWorker::new("w-1", ctx);

        let a = Job::new(Intent::new("i-1", "x", "acct", "post"), clock.now());
        let b = Job::new(Intent::new("i-2", "x", "acct", "post"), clock.now());
        worker.ctx.queue.enqueue(a.clone()).await.unwrap();
        worker.ctx.queue.enqueue(b.clone()).await.unwrap();

        assert_eq!(worker.run_once().await.unwrap(), 2);
        assert_eq!(adapter.calls(), 2);
        for id in [a.id, b.id] {
            let stored = worker.ctx.queue.get(id).await.unwrap().unwrap();
            assert_eq!(stored.state, JobState::Completed);
        }
    }
}
