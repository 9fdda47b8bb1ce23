use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::clock::{self, SharedClock};
use crate::error::{ExecutionError, Result};

use super::job::JobId;
use super::result::{EnvelopeId, ResultEnvelope};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InboxState {
    Pending,
    Leased,
    Acked,
}

impl InboxState {
    pub fn as_str(&self) -> &'static str {
        match self {
            InboxState::Pending => "pending",
            InboxState::Leased => "leased",
            InboxState::Acked => "acked",
        }
    }
}

impl FromStr for InboxState {
    type Err = ExecutionError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(InboxState::Pending),
            "leased" => Ok(InboxState::Leased),
            "acked" => Ok(InboxState::Acked),
            other => Err(ExecutionError::Internal(format!(
                "unknown inbox state {other}"
            ))),
        }
    }
}

/// One stored envelope plus its delivery lease.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InboxRecord {
    pub id: EnvelopeId,
    pub envelope: ResultEnvelope,
    pub state: InboxState,
    pub leased_by: Option<String>,
    pub lease_until: Option<DateTime<Utc>>,
    pub delivery_count: u32,
}

/// Durable channel carrying terminal results back to the producer.
#[async_trait]
pub trait ResultInbox: Send + Sync {
    /// Stores the envelope. Returns `false` when an envelope for the same
    /// job is already present.
    async fn append(&self, envelope: ResultEnvelope) -> Result<bool>;

    /// Leases up to `batch` pending envelopes, oldest first.
    async fn lease(
        &self,
        consumer: &str,
        batch: usize,
        visibility_timeout: Duration,
    ) -> Result<Vec<InboxRecord>>;

    async fn ack(&self, id: EnvelopeId, consumer: &str) -> Result<()>;

    async fn reclaim_expired(&self) -> Result<u64>;

    /// Deletes acknowledged envelopes received before `older_than`. A job
    /// whose envelope was pruned is no longer deduplicated on append.
    async fn prune_acked(&self, older_than: DateTime<Utc>) -> Result<u64>;

    /// Envelopes not yet acknowledged.
    async fn depth(&self) -> Result<usize>;
}

#[derive(Default)]
struct InboxInner {
    records: HashMap<EnvelopeId, InboxRecord>,
    seen_jobs: HashSet<JobId>,
}

pub struct InMemoryResultInbox {
    inner: Mutex<InboxInner>,
    clock: SharedClock,
}

impl fmt::Debug for InMemoryResultInbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("InMemoryResultInbox")
            .field("records", &inner.records.len())
            .finish()
    }
}

impl InMemoryResultInbox {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            inner: Mutex::new(InboxInner::default()),
            clock,
        }
    }

    /// Every stored envelope, acknowledged or not. Test and audit helper.
    pub fn envelopes(&self) -> Vec<ResultEnvelope> {
        let inner = self.inner.lock();
        let mut out: Vec<_> = inner.records.values().map(|r| r.envelope.clone()).collect();
        out.sort_by(|a, b| a.received_at.cmp(&b.received_at));
        out
    }
}

#[async_trait]
impl ResultInbox for InMemoryResultInbox {
    async fn append(&self, envelope: ResultEnvelope) -> Result<bool> {
        let mut inner = self.inner.lock();
        if !inner.seen_jobs.insert(envelope.job_id) {
            debug!(job = %envelope.job_id, "duplicate result envelope ignored");
            return Ok(false);
        }
        let id = EnvelopeId::new();
        inner.records.insert(
            id,
            InboxRecord {
                id,
                envelope,
                state: InboxState::Pending,
                leased_by: None,
                lease_until: None,
                delivery_count: 0,
            },
        );
        Ok(true)
    }

    async fn lease(
        &self,
        consumer: &str,
        batch: usize,
        visibility_timeout: Duration,
    ) -> Result<Vec<InboxRecord>> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        let mut pending: Vec<(DateTime<Utc>, EnvelopeId)> = inner
            .records
            .values()
            .filter(|r| r.state == InboxState::Pending)
            .map(|r| (r.envelope.received_at, r.id))
            .collect();
        pending.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.0.cmp(&b.1.0)));

        let mut out = Vec::new();
        for (_, id) in pending.into_iter().take(batch) {
            if let Some(record) = inner.records.get_mut(&id) {
                record.state = InboxState::Leased;
                record.leased_by = Some(consumer.to_string());
                record.lease_until = Some(clock::saturating_add(now, visibility_timeout));
                record.delivery_count += 1;
                out.push(record.clone());
            }
        }
        Ok(out)
    }

    async fn ack(&self, id: EnvelopeId, consumer: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        let record = inner
            .records
            .get_mut(&id)
            .ok_or_else(|| ExecutionError::NotFound(format!("envelope {id}")))?;
        if record.state != InboxState::Leased || record.leased_by.as_deref() != Some(consumer) {
            return Err(ExecutionError::LeaseMismatch(format!(
                "envelope {id} is not leased by {consumer}"
            )));
        }
        record.state = InboxState::Acked;
        record.leased_by = None;
        record.lease_until = None;
        Ok(())
    }

    async fn reclaim_expired(&self) -> Result<u64> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        let mut reclaimed = 0;
        for record in inner.records.values_mut() {
            if record.state == InboxState::Leased
                && record.lease_until.is_some_and(|until| until <= now)
            {
                warn!(envelope = %record.id, job = %record.envelope.job_id, "inbox lease expired; requeueing");
                record.state = InboxState::Pending;
                record.leased_by = None;
                record.lease_until = None;
                reclaimed += 1;
            }
        }
        Ok(reclaimed)
    }

    async fn prune_acked(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let mut inner = self.inner.lock();
        let InboxInner { records, seen_jobs } = &mut *inner;
        let before = records.len();
        records.retain(|_, record| {
            let expired =
                record.state == InboxState::Acked && record.envelope.received_at < older_than;
            if expired {
                seen_jobs.remove(&record.envelope.job_id);
            }
            !expired
        });
        let pruned = (before - records.len()) as u64;
        if pruned > 0 {
            debug!(pruned, "acknowledged envelopes pruned");
        }
        Ok(pruned)
    }

    async fn depth(&self) -> Result<usize> {
        Ok(self
            .inner
            .lock()
            .records
            .values()
            .filter(|r| r.state != InboxState::Acked)
            .count())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::execution::job::{Intent, Job};
    use crate::execution::result::ExecutionResult;

    fn envelope(clock: &ManualClock) -> ResultEnvelope {
        let job = Job::new(Intent::new("i", "x", "t", "post"), clock.now());
        ResultEnvelope::for_job(&job, ExecutionResult::success(), clock.now())
    }

    #[tokio::test]
    async fn append_is_idempotent_per_job() {
        let clock = ManualClock::default();
        let inbox = InMemoryResultInbox::new(Arc::new(clock.clone()));
        let env = envelope(&clock);
        assert!(inbox.append(env.clone()).await.unwrap());
        assert!(!inbox.append(env).await.unwrap());
        assert_eq!(inbox.depth().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn leased_envelopes_are_hidden_until_expiry_then_redelivered() {
        let clock = ManualClock::default();
        let inbox = InMemoryResultInbox::new(Arc::new(clock.clone()));
        inbox.append(envelope(&clock)).await.unwrap();

        let first = inbox.lease("d1", 10, Duration::seconds(5)).await.unwrap();
        assert_eq!(first.len(), 1);
        assert!(inbox.lease("d2", 10, Duration::seconds(5)).await.unwrap().is_empty());

        clock.advance_secs(5);
        assert_eq!(inbox.reclaim_expired().await.unwrap(), 1);
        let second = inbox.lease("d2", 10, Duration::seconds(5)).await.unwrap();
        assert_eq!(second[0].delivery_count, 2);

        assert!(inbox.ack(second[0].id, "d1").await.is_err());
        inbox.ack(second[0].id, "d2").await.unwrap();
        assert_eq!(inbox.depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn prune_drops_old_acknowledged_envelopes_only() {
        let clock = ManualClock::default();
        let inbox = InMemoryResultInbox::new(Arc::new(clock.clone()));
        let acked = envelope(&clock);
        let pending = envelope(&clock);
        inbox.append(acked.clone()).await.unwrap();
        inbox.append(pending.clone()).await.unwrap();
        let leased = inbox.lease("d", 10, Duration::seconds(5)).await.unwrap();
        let acked_id = leased
            .iter()
            .find(|r| r.envelope.job_id == acked.job_id)
            .map(|r| r.id)
            .unwrap();
        inbox.ack(acked_id, "d").await.unwrap();

        clock.advance_secs(7_200);
        assert_eq!(inbox.prune_acked(clock.now() - Duration::hours(1)).await.unwrap(), 1);
        let left: Vec<_> = inbox.envelopes().into_iter().map(|e| e.job_id).collect();
        assert_eq!(left, vec![pending.job_id]);
        assert_eq!(inbox.depth().await.unwrap(), 1);
    }
}
