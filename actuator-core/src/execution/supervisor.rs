use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::error::Result;

use super::worker::{ExecutionWorker, WorkerContext};

struct WorkerSlot {
    worker: Arc<ExecutionWorker>,
    handle: Option<JoinHandle<()>>,
    restarts: u32,
}

/// Result of one supervision pass.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupervisorReport {
    pub restarted: Vec<String>,
    pub stale: Vec<String>,
    pub reclaimed: u64,
}

/// Keeps worker loops alive and recovers leases held by stuck workers.
pub struct WorkerSupervisor {
    ctx: WorkerContext,
    slots: Mutex<Vec<WorkerSlot>>,
    shutdown: CancellationToken,
}

impl fmt::Debug for WorkerSupervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let workers = self.slots.try_lock().map(|s| s.len()).unwrap_or_default();
        f.debug_struct("WorkerSupervisor")
            .field("workers", &workers)
            .field("shutdown_cancelled", &self.shutdown.is_cancelled())
            .finish()
    }
}

impl WorkerSupervisor {
    pub fn new(ctx: WorkerContext, shutdown: CancellationToken) -> Self {
        Self {
            ctx,
            slots: Mutex::new(Vec::new()),
            shutdown,
        }
    }

    /// Registers a worker. It is spawned by [`start`](Self::start) or by the
    /// next liveness check after start.
    pub async fn add_worker(&self, worker: Arc<ExecutionWorker>) {
        self.slots.lock().await.push(WorkerSlot {
            worker,
            handle: None,
            restarts: 0,
        });
    }

    pub async fn worker_ids(&self) -> Vec<String> {
        self.slots
            .lock()
            .await
            .iter()
            .map(|s| s.worker.worker_id().to_string())
            .collect()
    }

    pub async fn restart_count(&self, worker_id: &str) -> Option<u32> {
        self.slots
            .lock()
            .await
            .iter()
            .find(|s| s.worker.worker_id() == worker_id)
            .map(|s| s.restarts)
    }

    fn spawn(&self, worker: &Arc<ExecutionWorker>) -> JoinHandle<()> {
        tokio::spawn(Arc::clone(worker).run(self.shutdown.clone()))
    }

    pub async fn start(&self) {
        let mut slots = self.slots.lock().await;
        for slot in slots.iter_mut().filter(|s| s.handle.is_none()) {
            info!(worker = %slot.worker.worker_id(), "spawning worker");
            slot.handle = Some(self.spawn(&slot.worker));
        }
    }

    /// Respawns worker loops that have exited (panic or abort) while the
    /// runtime is still running.
    pub async fn check_liveness(&self) -> Vec<String> {
        if self.shutdown.is_cancelled() {
            return Vec::new();
        }
        let mut restarted = Vec::new();
        let mut slots = self.slots.lock().await;
        for slot in slots.iter_mut() {
            let dead = match slot.handle.as_ref() {
                Some(handle) => handle.is_finished(),
                None => false,
            };
            if !dead {
                continue;
            }
            if let Some(handle) = slot.handle.take()
                && let Err(err) = handle.await
            {
                warn!(worker = %slot.worker.worker_id(), error = %err, "worker task ended abnormally");
            }
            slot.restarts += 1;
            warn!(
                worker = %slot.worker.worker_id(),
                restarts = slot.restarts,
                "restarting dead worker"
            );
            slot.handle = Some(self.spawn(&slot.worker));
            restarted.push(slot.worker.worker_id().to_string());
        }
        restarted
    }

    /// Flags workers whose heartbeat is older than their own visibility
    /// timeout and triggers a queue-wide reclaim when any is found.
    pub async fn check_heartbeats(&self) -> Result<(Vec<String>, u64)> {
        let workers: Vec<Arc<ExecutionWorker>> = self
            .slots
            .lock()
            .await
            .iter()
            .map(|s| Arc::clone(&s.worker))
            .collect();

        let now = self.ctx.clock.now();
        let mut stale = Vec::new();
        for worker in workers {
            let Some(beat) = self.ctx.heartbeats.get(worker.worker_id()).await? else {
                continue;
            };
            if beat.status == "stopped" {
                continue;
            }
            if now - beat.updated_at > worker.visibility_timeout() {
                warn!(
                    worker = %worker.worker_id(),
                    last_beat = %beat.updated_at,
                    status = %beat.status,
                    "worker heartbeat is stale"
                );
                stale.push(worker.worker_id().to_string());
            }
        }

        let reclaimed = if stale.is_empty() {
            0
        } else {
            let n = self.ctx.queue.reclaim_expired().await?;
            if n > 0 {
                info!(reclaimed = n, "reclaimed leases after stale heartbeat");
            }
            n
        };
        Ok((stale, reclaimed))
    }

    pub async fn check_once(&self) -> Result<SupervisorReport> {
        let restarted = self.check_liveness().await;
        let (stale, reclaimed) = self.check_heartbeats().await?;
        Ok(SupervisorReport {
            restarted,
            stale,
            reclaimed,
        })
    }

    pub async fn run(self: Arc<Self>) {
        let span = info_span!("worker_supervisor");
        async move {
            let interval =
                std::time::Duration::from_millis(self.ctx.config.supervisor.check_interval_ms);
            loop {
                tokio::select! {
                    _ = self.shutdown.cancelled() => {
                        debug!("supervisor shutting down");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {
                        if let Err(err) = self.check_once().await {
                            warn!(error = %err, "supervisor check failed");
                        }
                    }
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Cancels every worker loop and waits for each one, bounded by the
    /// configured shutdown timeout.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let timeout =
            std::time::Duration::from_millis(self.ctx.config.supervisor.shutdown_timeout_ms);
        let handles: Vec<(String, JoinHandle<()>)> = {
            let mut slots = self.slots.lock().await;
            slots
                .iter_mut()
                .filter_map(|s| s.handle.take().map(|h| (s.worker.worker_id().to_string(), h)))
                .collect()
        };
        for (worker_id, handle) in handles {
            match tokio::time::timeout(timeout, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(worker = %worker_id, error = %err, "worker task failed"),
                Err(_) => warn!(worker = %worker_id, "worker task timed out during shutdown"),
            }
        }
    }
}
