use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Mutex, Notify, broadcast};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::{SharedClock, system_clock};
use crate::error::{ExecutionError, Result};

use super::adapter::{AdapterRegistry, ContentMaterializer, ExecutionAdapter};
use super::adaptive::{AdaptiveRateController, AdaptiveRouteSnapshot};
use super::circuit::{CircuitBreaker, CircuitEvent};
use super::config::ExecutionConfig;
use super::dispatcher::{ResultApplier, ResultDispatcher, SlaStats};
use super::events::{ExecutionEvent, ExecutionEventPayload, InProcExecutionEventBus};
use super::heartbeat::{HeartbeatStore, InMemoryHeartbeatStore, WorkerHeartbeat};
use super::idempotency::{IdempotencyStore, InMemoryIdempotencyStore};
use super::inbox::{InMemoryResultInbox, ResultInbox};
use super::job::{DlqState, Intent, Job, JobHandle, JobId};
use super::queue::{ExecutionQueue, InMemoryExecutionQueue, QueueDepth};
use super::rate_limit::{SlidingWindowRateLimiter, WindowSnapshot};
use super::retry::RetryScheduler;
use super::supervisor::WorkerSupervisor;
use super::worker::{ExecutionWorker, WorkerContext};

/// Composition root: owns the shared stores, the worker pool, the result
/// dispatcher, the supervisor and the lease housekeeper.
pub struct ExecutionRuntime {
    ctx: WorkerContext,
    event_bus: Arc<InProcExecutionEventBus>,
    dispatcher: Arc<ResultDispatcher>,
    supervisor: Arc<WorkerSupervisor>,
    shutdown_token: CancellationToken,
    task_handles: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl fmt::Debug for ExecutionRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let task_count = self
            .task_handles
            .try_lock()
            .map(|handles| handles.len())
            .unwrap_or_default();
        f.debug_struct("ExecutionRuntime")
            .field("config", &self.ctx.config)
            .field("adapters", &self.ctx.adapters)
            .field("event_bus", &self.event_bus)
            .field("task_count", &task_count)
            .field("started", &self.started.load(Ordering::SeqCst))
            .field("shutdown_cancelled", &self.shutdown_token.is_cancelled())
            .finish()
    }
}

impl ExecutionRuntime {
    pub fn builder(config: ExecutionConfig) -> ExecutionRuntimeBuilder {
        ExecutionRuntimeBuilder::new(config)
    }

    pub fn config(&self) -> &ExecutionConfig {
        &self.ctx.config
    }

    pub fn context(&self) -> &WorkerContext {
        &self.ctx
    }

    pub fn dispatcher(&self) -> Arc<ResultDispatcher> {
        Arc::clone(&self.dispatcher)
    }

    pub fn supervisor(&self) -> Arc<WorkerSupervisor> {
        Arc::clone(&self.supervisor)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.event_bus.subscribe()
    }

    /// A worker bound to this runtime's stores, not managed by the
    /// supervisor. Useful for driving the pipeline step by step.
    pub fn worker(&self, worker_id: impl Into<String>) -> ExecutionWorker {
        ExecutionWorker::new(worker_id, self.ctx.clone())
    }

    /// Job for `intent` carrying the configured retry budget.
    pub fn new_job(&self, intent: Intent) -> Job {
        Job::new(intent, self.ctx.clock.now()).with_max_attempts(self.ctx.config.retry.max_attempts)
    }

    pub async fn enqueue(&self, job: Job) -> Result<JobHandle> {
        let handle = self.ctx.queue.enqueue(job).await?;
        let payload = match handle.merged_into {
            Some(existing) => ExecutionEventPayload::Merged {
                existing_job_id: existing,
                intent_id: handle.intent_id.clone(),
            },
            None => ExecutionEventPayload::Enqueued {
                job_id: handle.job_id,
                intent_id: handle.intent_id.clone(),
            },
        };
        self.ctx.emit(payload).await;
        Ok(handle)
    }

    pub async fn get(&self, job_id: JobId) -> Result<Option<Job>> {
        self.ctx.queue.get(job_id).await
    }

    pub async fn list_dlq(&self, limit: usize) -> Result<Vec<Job>> {
        self.ctx.queue.list_dlq(limit).await
    }

    pub async fn replay_dlq(&self, job_id: JobId, actor: &str) -> Result<JobHandle> {
        let handle = self.ctx.queue.replay_dlq(job_id, actor).await?;
        self.ctx
            .emit(ExecutionEventPayload::Replayed {
                job_id,
                child_job_id: handle.job_id,
                actor: actor.to_string(),
            })
            .await;
        Ok(handle)
    }

    pub async fn resolve_dlq(&self, job_id: JobId, actor: &str, state: DlqState) -> Result<Job> {
        let job = self.ctx.queue.resolve_dlq(job_id, actor, state).await?;
        self.ctx
            .emit(ExecutionEventPayload::Resolved {
                job_id,
                dlq_state: state,
                actor: actor.to_string(),
            })
            .await;
        Ok(job)
    }

    pub async fn depth(&self) -> Result<QueueDepth> {
        self.ctx.queue.depth().await
    }

    pub async fn depth_by_context(&self) -> Result<BTreeMap<String, usize>> {
        self.ctx.queue.depth_by_context().await
    }

    pub async fn inbox_depth(&self) -> Result<usize> {
        self.ctx.inbox.depth().await
    }

    /// Drains pending circuit transitions and republishes them on the event
    /// bus.
    pub async fn drain_circuit_events(&self) -> Vec<CircuitEvent> {
        let events = self.ctx.circuit.drain_events();
        for event in &events {
            self.ctx
                .emit(ExecutionEventPayload::CircuitTransition(event.clone()))
                .await;
        }
        events
    }

    pub fn rate_limit_snapshot(&self) -> Vec<WindowSnapshot> {
        self.ctx.rate_limiter.snapshot(self.ctx.clock.now())
    }

    pub fn adaptive_snapshot(&self) -> Vec<AdaptiveRouteSnapshot> {
        self.ctx.adaptive.snapshot()
    }

    pub fn sla_stats(&self) -> SlaStats {
        self.dispatcher.stats()
    }

    pub async fn worker_heartbeats(&self) -> Result<Vec<WorkerHeartbeat>> {
        self.ctx.heartbeats.list().await
    }

    /// Spawns the worker pool, dispatcher, supervisor and housekeeper.
    /// Calling it again is a no-op.
    pub async fn start(&self) -> Result<()> {
        if self.shutdown_token.is_cancelled() {
            return Err(ExecutionError::Internal("runtime already shut down".into()));
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let worker_count = self.ctx.config.supervisor.worker_count;
        for index in 0..worker_count {
            let worker = Arc::new(self.worker(format!("worker-{index}")));
            self.supervisor.add_worker(worker).await;
        }
        self.supervisor.start().await;

        let mut handles = self.task_handles.lock().await;
        handles.push(tokio::spawn(
            Arc::clone(&self.dispatcher).run(self.shutdown_token.clone()),
        ));
        handles.push(tokio::spawn(Arc::clone(&self.supervisor).run()));
        handles.push(self.spawn_housekeeper());

        info!(
            workers = worker_count,
            adapters = ?self.ctx.adapters.platforms(),
            "execution runtime started"
        );
        Ok(())
    }

    fn spawn_housekeeper(&self) -> JoinHandle<()> {
        let queue = Arc::clone(&self.ctx.queue);
        let inbox = Arc::clone(&self.ctx.inbox);
        let clock = self.ctx.clock.clone();
        let retention = self.ctx.config.lease.retention();
        let interval =
            std::time::Duration::from_millis(self.ctx.config.lease.housekeeper_interval_ms);
        let shutdown = self.shutdown_token.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!("housekeeper shutting down");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {
                        match queue.reclaim_expired().await {
                            Ok(0) => {}
                            Ok(n) => info!(reclaimed = n, "housekeeper reclaimed expired job leases"),
                            Err(err) => warn!(error = %err, "housekeeper queue reclaim failed"),
                        }
                        match inbox.reclaim_expired().await {
                            Ok(0) => {}
                            Ok(n) => info!(reclaimed = n, "housekeeper reclaimed expired inbox leases"),
                            Err(err) => warn!(error = %err, "housekeeper inbox reclaim failed"),
                        }
                        let cutoff = crate::clock::saturating_sub(clock.now(), retention);
                        if let Err(err) = queue.prune_completed(cutoff).await {
                            warn!(error = %err, "housekeeper job pruning failed");
                        }
                        if let Err(err) = inbox.prune_acked(cutoff).await {
                            warn!(error = %err, "housekeeper inbox pruning failed");
                        }
                    }
                }
            }
        })
    }

    /// Stops intake and waits for every loop, each bounded by the configured
    /// shutdown timeout. In-flight adapter calls are allowed to finish.
    pub async fn shutdown(&self) -> Result<()> {
        info!("initiating graceful shutdown of execution runtime");
        self.shutdown_token.cancel();
        self.supervisor.shutdown().await;

        let timeout =
            std::time::Duration::from_millis(self.ctx.config.supervisor.shutdown_timeout_ms);
        let handles = {
            let mut guard = self.task_handles.lock().await;
            std::mem::take(&mut *guard)
        };
        for handle in handles {
            match tokio::time::timeout(timeout, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(error = %err, "runtime task failed"),
                Err(_) => warn!("runtime task timed out during shutdown"),
            }
        }
        info!("execution runtime shutdown complete");
        Ok(())
    }
}

/// Assembles an [`ExecutionRuntime`]. Stores default to the in-memory
/// backings; the result applier is required.
pub struct ExecutionRuntimeBuilder {
    config: ExecutionConfig,
    clock: Option<SharedClock>,
    queue: Option<Arc<dyn ExecutionQueue>>,
    inbox: Option<Arc<dyn ResultInbox>>,
    idempotency: Option<Arc<dyn IdempotencyStore>>,
    heartbeats: Option<Arc<dyn HeartbeatStore>>,
    adapters: AdapterRegistry,
    materializer: Option<Arc<dyn ContentMaterializer>>,
    applier: Option<Arc<dyn ResultApplier>>,
    event_bus: Option<Arc<InProcExecutionEventBus>>,
}

impl fmt::Debug for ExecutionRuntimeBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionRuntimeBuilder")
            .field("config", &self.config)
            .field("clock_set", &self.clock.is_some())
            .field("queue_set", &self.queue.is_some())
            .field("inbox_set", &self.inbox.is_some())
            .field("idempotency_set", &self.idempotency.is_some())
            .field("heartbeats_set", &self.heartbeats.is_some())
            .field("adapters", &self.adapters)
            .field("materializer_set", &self.materializer.is_some())
            .field("applier_set", &self.applier.is_some())
            .finish()
    }
}

impl ExecutionRuntimeBuilder {
    pub fn new(config: ExecutionConfig) -> Self {
        Self {
            config,
            clock: None,
            queue: None,
            inbox: None,
            idempotency: None,
            heartbeats: None,
            adapters: AdapterRegistry::new(),
            materializer: None,
            applier: None,
            event_bus: None,
        }
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn with_queue(mut self, queue: Arc<dyn ExecutionQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn with_inbox(mut self, inbox: Arc<dyn ResultInbox>) -> Self {
        self.inbox = Some(inbox);
        self
    }

    pub fn with_idempotency(mut self, store: Arc<dyn IdempotencyStore>) -> Self {
        self.idempotency = Some(store);
        self
    }

    pub fn with_heartbeats(mut self, store: Arc<dyn HeartbeatStore>) -> Self {
        self.heartbeats = Some(store);
        self
    }

    pub fn with_adapter(
        mut self,
        platform: impl Into<String>,
        adapter: Arc<dyn ExecutionAdapter>,
    ) -> Self {
        self.adapters.register(platform, adapter);
        self
    }

    pub fn with_adapters(mut self, adapters: AdapterRegistry) -> Self {
        self.adapters = adapters;
        self
    }

    pub fn with_materializer(mut self, materializer: Arc<dyn ContentMaterializer>) -> Self {
        self.materializer = Some(materializer);
        self
    }

    pub fn with_applier(mut self, applier: Arc<dyn ResultApplier>) -> Self {
        self.applier = Some(applier);
        self
    }

    pub fn with_event_bus(mut self, bus: Arc<InProcExecutionEventBus>) -> Self {
        self.event_bus = Some(bus);
        self
    }

    pub fn build(self) -> Result<ExecutionRuntime> {
        let applier = self
            .applier
            .ok_or_else(|| ExecutionError::Internal("result applier dependency missing".into()))?;
        let clock = self.clock.unwrap_or_else(system_clock);
        let config = self.config;
        let stale_after = crate::clock::seconds(config.idempotency.stale_after_secs);

        let queue = self
            .queue
            .unwrap_or_else(|| Arc::new(InMemoryExecutionQueue::new(clock.clone())));
        let inbox = self
            .inbox
            .unwrap_or_else(|| Arc::new(InMemoryResultInbox::new(clock.clone())));
        let idempotency = self.idempotency.unwrap_or_else(|| {
            Arc::new(InMemoryIdempotencyStore::new(stale_after, clock.clone()))
        });
        let heartbeats = self
            .heartbeats
            .unwrap_or_else(|| Arc::new(InMemoryHeartbeatStore::new(clock.clone())));
        let event_bus = self
            .event_bus
            .unwrap_or_else(|| Arc::new(InProcExecutionEventBus::default()));

        let ctx = WorkerContext {
            queue,
            inbox,
            idempotency,
            heartbeats,
            circuit: Arc::new(CircuitBreaker::new(config.circuit, clock.clone())),
            rate_limiter: Arc::new(SlidingWindowRateLimiter::new(config.rate_limit.clone())),
            adaptive: Arc::new(AdaptiveRateController::new(config.adaptive.clone())),
            retry: RetryScheduler::new(config.retry),
            adapters: self.adapters,
            materializer: self.materializer,
            events: event_bus.clone(),
            result_notify: Arc::new(Notify::new()),
            config: Arc::new(config),
            clock,
        };

        let shutdown_token = CancellationToken::new();
        let dispatcher = Arc::new(ResultDispatcher::new("dispatcher-0", ctx.clone(), applier));
        let supervisor = Arc::new(WorkerSupervisor::new(ctx.clone(), shutdown_token.clone()));

        Ok(ExecutionRuntime {
            ctx,
            event_bus,
            dispatcher,
            supervisor,
            shutdown_token,
            task_handles: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        })
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::execution::result::ResultEnvelope;

    struct Noop;

    #[async_trait]
    impl ResultApplier for Noop {
        async fn apply_result(&self, _envelope: &ResultEnvelope) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn build_requires_an_applier() {
        let err = ExecutionRuntime::builder(ExecutionConfig::default())
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("result applier"));
    }

    #[tokio::test]
    async fn enqueue_publishes_enqueued_then_merged() {
        let runtime = ExecutionRuntime::builder(ExecutionConfig::default())
            .with_applier(Arc::new(Noop))
            .build()
            .unwrap();
        let mut rx = runtime.subscribe();

        let first = runtime
            .enqueue(runtime.new_job(Intent::new("i", "x", "t", "post")))
            .await
            .unwrap();
        runtime
            .enqueue(runtime.new_job(Intent::new("i", "x", "t", "post")))
            .await
            .unwrap();

        assert!(matches!(
            rx.recv().await.unwrap().payload,
            ExecutionEventPayload::Enqueued { job_id, .. } if job_id == first.job_id
        ));
        assert!(matches!(
            rx.recv().await.unwrap().payload,
            ExecutionEventPayload::Merged { existing_job_id, .. } if existing_job_id == first.job_id
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn start_is_idempotent_and_shutdown_joins_tasks() {
        let mut config = ExecutionConfig::default();
        config.supervisor.worker_count = 2;
        let runtime = ExecutionRuntime::builder(config)
            .with_applier(Arc::new(Noop))
            .build()
            .unwrap();

        runtime.start().await.unwrap();
        runtime.start().await.unwrap();
        assert_eq!(runtime.supervisor().worker_ids().await.len(), 2);

        runtime.shutdown().await.unwrap();
        assert!(runtime.start().await.is_err());
    }
}
