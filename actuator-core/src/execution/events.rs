use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::Result;

use super::circuit::CircuitEvent;
use super::job::{DlqState, IntentId, JobId};
use super::result::FailureType;

/// Why a leased job went back to the queue without reaching the adapter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeferralReason {
    AdaptiveThrottle,
    CircuitOpen,
    RateLimited,
    InProgress,
}

impl fmt::Display for DeferralReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            DeferralReason::AdaptiveThrottle => "adaptive throttle",
            DeferralReason::CircuitOpen => "circuit open",
            DeferralReason::RateLimited => "rate limited",
            DeferralReason::InProgress => "idempotency in progress",
        };
        f.write_str(label)
    }
}

/// Lifecycle notifications emitted by the execution runtime.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionEventPayload {
    Enqueued {
        job_id: JobId,
        intent_id: IntentId,
    },
    Merged {
        existing_job_id: JobId,
        intent_id: IntentId,
    },
    Leased {
        job_id: JobId,
        worker_id: String,
        attempt: u32,
    },
    Deferred {
        job_id: JobId,
        reason: DeferralReason,
        available_at: DateTime<Utc>,
    },
    Completed {
        job_id: JobId,
        failure_type: FailureType,
    },
    Retried {
        job_id: JobId,
        attempt: u32,
        available_at: DateTime<Utc>,
    },
    DeadLettered {
        job_id: JobId,
        dlq_state: DlqState,
        reason: String,
    },
    Replayed {
        job_id: JobId,
        child_job_id: JobId,
        actor: String,
    },
    Resolved {
        job_id: JobId,
        dlq_state: DlqState,
        actor: String,
    },
    CircuitTransition(CircuitEvent),
    SlaViolation {
        job_id: JobId,
        latency_ms: i64,
        sla_ms: i64,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecutionEvent {
    pub at: DateTime<Utc>,
    pub payload: ExecutionEventPayload,
}

impl ExecutionEvent {
    pub fn new(at: DateTime<Utc>, payload: ExecutionEventPayload) -> Self {
        Self { at, payload }
    }
}

#[async_trait]
pub trait ExecutionEventPublisher: Send + Sync {
    async fn publish(&self, event: ExecutionEvent) -> Result<()>;
}

/// In-process fan-out of execution events to observers inside the runtime.
pub struct InProcExecutionEventBus {
    sender: broadcast::Sender<ExecutionEvent>,
    capacity: usize,
}

impl fmt::Debug for InProcExecutionEventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InProcExecutionEventBus")
            .field("capacity", &self.capacity)
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl InProcExecutionEventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender, capacity }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.sender.subscribe()
    }
}

impl Default for InProcExecutionEventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl ExecutionEventPublisher for InProcExecutionEventBus {
    async fn publish(&self, event: ExecutionEvent) -> Result<()> {
        // No subscribers is not an error.
        let _ = self.sender.send(event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = InProcExecutionEventBus::new(8);
        bus.publish(ExecutionEvent::new(
            Utc::now(),
            ExecutionEventPayload::Completed {
                job_id: JobId::new(),
                failure_type: FailureType::None,
            },
        ))
        .await
        .unwrap();

        let mut rx = bus.subscribe();
        let job_id = JobId::new();
        bus.publish(ExecutionEvent::new(
            Utc::now(),
            ExecutionEventPayload::Deferred {
                job_id,
                reason: DeferralReason::RateLimited,
                available_at: Utc::now(),
            },
        ))
        .await
        .unwrap();

        match rx.recv().await.unwrap().payload {
            ExecutionEventPayload::Deferred { job_id: got, reason, .. } => {
                assert_eq!(got, job_id);
                assert_eq!(reason, DeferralReason::RateLimited);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
