use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::clock::{self, SharedClock};
use crate::error::Result;

use super::config::DispatcherConfig;
use super::events::ExecutionEventPayload;
use super::inbox::ResultInbox;
use super::result::ResultEnvelope;
use super::worker::WorkerContext;

/// Producer-side callback receiving terminal results.
///
/// Delivery is at-least-once: an envelope whose application fails or whose
/// lease expires is delivered again, so implementations must tolerate
/// duplicates keyed by job id.
#[async_trait]
pub trait ResultApplier: Send + Sync {
    async fn apply_result(&self, envelope: &ResultEnvelope) -> Result<()>;
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlaStats {
    pub applied: u64,
    pub violations: u64,
    pub apply_failures: u64,
    pub max_latency_ms: i64,
    pub last_latency_ms: i64,
}

/// Hybrid push/poll consumer of the result inbox.
pub struct ResultDispatcher {
    consumer_id: String,
    config: DispatcherConfig,
    inbox: Arc<dyn ResultInbox>,
    applier: Arc<dyn ResultApplier>,
    notify: Arc<Notify>,
    ctx: WorkerContext,
    clock: SharedClock,
    stats: Mutex<SlaStats>,
}

impl fmt::Debug for ResultDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultDispatcher")
            .field("consumer_id", &self.consumer_id)
            .field("stats", &*self.stats.lock())
            .finish()
    }
}

impl ResultDispatcher {
    pub fn new(
        consumer_id: impl Into<String>,
        ctx: WorkerContext,
        applier: Arc<dyn ResultApplier>,
    ) -> Self {
        Self {
            consumer_id: consumer_id.into(),
            config: ctx.config.dispatcher,
            inbox: Arc::clone(&ctx.inbox),
            applier,
            notify: Arc::clone(&ctx.result_notify),
            clock: Arc::clone(&ctx.clock),
            ctx,
            stats: Mutex::new(SlaStats::default()),
        }
    }

    /// Wakes the dispatcher without waiting for the next poll.
    pub fn notify(&self) {
        self.notify.notify_one();
    }

    pub fn stats(&self) -> SlaStats {
        self.stats.lock().clone()
    }

    /// Reclaims expired inbox leases, then applies one batch. Returns the
    /// number of envelopes applied and acknowledged.
    pub async fn run_cycle(&self) -> Result<usize> {
        let reclaimed = self.inbox.reclaim_expired().await?;
        if reclaimed > 0 {
            debug!(reclaimed, "inbox leases reclaimed");
        }

        let visibility = clock::seconds(self.config.visibility_timeout_secs);
        let records = self
            .inbox
            .lease(&self.consumer_id, self.config.batch_size, visibility)
            .await?;

        let mut applied = 0;
        for record in records {
            let envelope = &record.envelope;
            let latency_ms = (self.clock.now() - envelope.received_at).num_milliseconds();
            let violated = latency_ms > self.config.sla_ms;
            if violated {
                warn!(
                    job = %envelope.job_id,
                    latency_ms,
                    sla_ms = self.config.sla_ms,
                    "result applied outside sla"
                );
                self.ctx
                    .emit(ExecutionEventPayload::SlaViolation {
                        job_id: envelope.job_id,
                        latency_ms,
                        sla_ms: self.config.sla_ms,
                    })
                    .await;
            }

            if let Err(err) = self.applier.apply_result(envelope).await {
                warn!(job = %envelope.job_id, error = %err, "apply_result failed; envelope will be redelivered");
                self.stats.lock().apply_failures += 1;
                continue;
            }
            self.inbox.ack(record.id, &self.consumer_id).await?;
            applied += 1;

            let mut stats = self.stats.lock();
            stats.applied += 1;
            stats.last_latency_ms = latency_ms;
            stats.max_latency_ms = stats.max_latency_ms.max(latency_ms);
            if violated {
                stats.violations += 1;
            }
        }
        Ok(applied)
    }

    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let span = info_span!("result_dispatcher", consumer = %self.consumer_id);
        async move {
            info!("dispatcher started");
            let poll = std::time::Duration::from_millis(self.config.poll_interval_ms);
            while !shutdown.is_cancelled() {
                match self.run_cycle().await {
                    Ok(n) if n >= self.config.batch_size && n > 0 => continue,
                    Ok(_) => {}
                    Err(err) => warn!(error = %err, "dispatcher cycle failed"),
                }
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = self.notify.notified() => {}
                    _ = tokio::time::sleep(poll) => {}
                }
            }
            info!("dispatcher stopped");
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::error::ExecutionError;
    use crate::execution::adapter::AdapterRegistry;
    use crate::execution::config::ExecutionConfig;
    use crate::execution::job::{Intent, Job};
    use crate::execution::result::ExecutionResult;

    #[derive(Default)]
    struct Counting {
        applied: AtomicUsize,
        fail_first: AtomicUsize,
    }

    #[async_trait]
    impl ResultApplier for Counting {
        async fn apply_result(&self, _envelope: &ResultEnvelope) -> Result<()> {
            if self.fail_first.load(Ordering::SeqCst) > 0 {
                self.fail_first.fetch_sub(1, Ordering::SeqCst);
                return Err(ExecutionError::Internal("producer unavailable".into()));
            }
            self.applied.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn setup(applier: Arc<Counting>) -> (ResultDispatcher, ManualClock) {
        let clock = ManualClock::default();
        let mut cfg = ExecutionConfig::default();
        cfg.dispatcher.sla_ms = 1_000;
        cfg.dispatcher.visibility_timeout_secs = 5;
        let ctx = WorkerContext::in_memory(cfg, AdapterRegistry::new(), Arc::new(clock.clone()));
        (ResultDispatcher::new("d-1", ctx, applier), clock)
    }

    async fn append(dispatcher: &ResultDispatcher, clock: &ManualClock) {
        let job = Job::new(Intent::new("i", "x", "t", "post"), clock.now());
        let env = ResultEnvelope::for_job(&job, ExecutionResult::success(), clock.now());
        dispatcher.inbox.append(env).await.unwrap();
    }

    #[tokio::test]
    async fn applies_each_envelope_once_and_records_sla_violations() {
        let applier = Arc::new(Counting::default());
        let (dispatcher, clock) = setup(applier.clone());
        append(&dispatcher, &clock).await;
        clock.advance_secs(2);
        append(&dispatcher, &clock).await;

        assert_eq!(dispatcher.run_cycle().await.unwrap(), 2);
        assert_eq!(dispatcher.run_cycle().await.unwrap(), 0);
        assert_eq!(applier.applied.load(Ordering::SeqCst), 2);

        let stats = dispatcher.stats();
        assert_eq!(stats.applied, 2);
        assert_eq!(stats.violations, 1);
        assert_eq!(stats.max_latency_ms, 2_000);
    }

    #[tokio::test]
    async fn failed_application_is_redelivered_after_lease_expiry() {
        let applier = Arc::new(Counting {
            fail_first: AtomicUsize::new(1),
            ..Counting::default()
        });
        let (dispatcher, clock) = setup(applier.clone());
        append(&dispatcher, &clock).await;

        assert_eq!(dispatcher.run_cycle().await.unwrap(), 0);
        assert_eq!(dispatcher.run_cycle().await.unwrap(), 0);
        clock.advance_secs(5);
        assert_eq!(dispatcher.run_cycle().await.unwrap(), 1);
        assert_eq!(applier.applied.load(Ordering::SeqCst), 1);
        assert_eq!(dispatcher.stats().apply_failures, 1);
        assert_eq!(dispatcher.inbox.depth().await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn notify_wakes_the_loop_before_the_poll_interval() {
        let applier = Arc::new(Counting::default());
        let (dispatcher, clock) = setup(applier.clone());
        let dispatcher = Arc::new(dispatcher);
        let token = CancellationToken::new();
        let handle = tokio::spawn(Arc::clone(&dispatcher).run(token.clone()));

        tokio::task::yield_now().await;
        append(&dispatcher, &clock).await;
        dispatcher.notify();
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(applier.applied.load(Ordering::SeqCst), 1);

        token.cancel();
        handle.await.unwrap();
    }
}
