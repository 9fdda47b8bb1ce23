use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{ExecutionError, Result};

/// Unique identifier for execution jobs.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = ExecutionError;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| ExecutionError::Validation(format!("invalid job id {s}: {e}")))
    }
}

/// Identifier of the upstream intent. Assigned by the producer.
#[derive(Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IntentId(pub String);

impl IntentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IntentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for IntentId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// An already-decided intent to act on an external platform.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Intent {
    pub intent_id: IntentId,
    /// Adapter lookup key, e.g. `"slack"`.
    pub platform: String,
    /// Destination on the platform (channel, account, endpoint).
    pub target: String,
    pub action: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub payload: Value,
    /// Substituted for `payload` when content materialization fails.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_payload: Option<Value>,
}

impl Intent {
    pub fn new(
        intent_id: impl Into<IntentId>,
        platform: impl Into<String>,
        target: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        Self {
            intent_id: intent_id.into(),
            platform: platform.into(),
            target: target.into(),
            action: action.into(),
            payload: Value::Null,
            fallback_payload: None,
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_fallback(mut self, fallback: Value) -> Self {
        self.fallback_payload = Some(fallback);
        self
    }

    /// Routing key shared by the circuit breaker, rate limiter and adaptive
    /// controller.
    pub fn route_key(&self) -> String {
        format!("{}:{}", self.platform, self.target)
    }
}

impl From<String> for IntentId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Resource-reservation deltas reconciled upstream once the job settles.
pub type ReservationDelta = BTreeMap<String, f64>;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Leased,
    Completed,
    Dlq,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Leased => "leased",
            JobState::Completed => "completed",
            JobState::Dlq => "dlq",
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, JobState::Queued | JobState::Leased)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = ExecutionError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "queued" => Ok(JobState::Queued),
            "leased" => Ok(JobState::Leased),
            "completed" => Ok(JobState::Completed),
            "dlq" => Ok(JobState::Dlq),
            other => Err(ExecutionError::Internal(format!(
                "unknown job state {other}"
            ))),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DlqState {
    AwaitingManualAction,
    Terminal,
    Replayed,
    Resolved,
}

impl DlqState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DlqState::AwaitingManualAction => "awaiting_manual_action",
            DlqState::Terminal => "terminal",
            DlqState::Replayed => "replayed",
            DlqState::Resolved => "resolved",
        }
    }

    /// Only entries awaiting manual action may be replayed or resolved.
    pub fn is_closed(&self) -> bool {
        !matches!(self, DlqState::AwaitingManualAction)
    }
}

impl fmt::Display for DlqState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DlqState {
    type Err = ExecutionError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "awaiting_manual_action" => Ok(DlqState::AwaitingManualAction),
            "terminal" => Ok(DlqState::Terminal),
            "replayed" => Ok(DlqState::Replayed),
            "resolved" => Ok(DlqState::Resolved),
            other => Err(ExecutionError::InvalidTransition(format!(
                "unknown dlq state {other}"
            ))),
        }
    }
}

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Record stored by the execution queue for each unit of work.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub intent: Intent,
    pub context_key: String,
    #[serde(default)]
    pub reservation_delta: ReservationDelta,
    pub state: JobState,
    pub priority: f64,
    pub available_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub leased_by: Option<String>,
    pub lease_until: Option<DateTime<Utc>>,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub last_error: Option<String>,
    pub job_version: u32,
    pub parent_job_id: Option<JobId>,
    pub dlq_state: Option<DlqState>,
}

impl Job {
    pub fn new(intent: Intent, now: DateTime<Utc>) -> Self {
        Self {
            id: JobId::new(),
            intent,
            context_key: String::new(),
            reservation_delta: ReservationDelta::new(),
            state: JobState::Queued,
            priority: 0.0,
            available_at: now,
            created_at: now,
            updated_at: now,
            leased_by: None,
            lease_until: None,
            attempt_count: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            last_error: None,
            job_version: 1,
            parent_job_id: None,
            dlq_state: None,
        }
    }

    pub fn with_context(mut self, context_key: impl Into<String>) -> Self {
        self.context_key = context_key.into();
        self
    }

    pub fn with_priority(mut self, priority: f64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_reservation(mut self, key: impl Into<String>, delta: f64) -> Self {
        self.reservation_delta.insert(key.into(), delta);
        self
    }

    pub fn available_from(mut self, at: DateTime<Utc>) -> Self {
        self.available_at = at;
        self
    }

    pub fn intent_id(&self) -> &IntentId {
        &self.intent.intent_id
    }

    pub fn route_key(&self) -> String {
        self.intent.route_key()
    }

    /// Key guarding the external side effect of this job. Redelivery of the
    /// same job maps to the same key; a fresh job for the same intent
    /// (re-enqueue after completion, DLQ replay) executes independently.
    pub fn idempotency_key(&self) -> String {
        format!("{}:{}", self.intent.intent_id, self.id)
    }

    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }

    pub fn is_leased_by(&self, worker_id: &str) -> bool {
        self.state == JobState::Leased && self.leased_by.as_deref() == Some(worker_id)
    }

    /// Rejects records that would break queue ordering or the retry budget.
    pub fn validate(&self) -> Result<()> {
        if !self.priority.is_finite() {
            return Err(ExecutionError::Validation(format!(
                "job {} has non-finite priority",
                self.id
            )));
        }
        if self.max_attempts == 0 {
            return Err(ExecutionError::Validation(format!(
                "job {} must allow at least one attempt",
                self.id
            )));
        }
        if self.intent.intent_id.0.is_empty() {
            return Err(ExecutionError::Validation("intent id must not be empty".into()));
        }
        Ok(())
    }

    /// Fresh queued job spawned by a DLQ replay. Attempts reset, lineage kept.
    pub fn replay_child(&self, now: DateTime<Utc>) -> Job {
        Job {
            id: JobId::new(),
            intent: self.intent.clone(),
            context_key: self.context_key.clone(),
            reservation_delta: self.reservation_delta.clone(),
            state: JobState::Queued,
            priority: self.priority,
            available_at: now,
            created_at: now,
            updated_at: now,
            leased_by: None,
            lease_until: None,
            attempt_count: 0,
            max_attempts: self.max_attempts,
            last_error: None,
            job_version: self.job_version + 1,
            parent_job_id: Some(self.id),
            dlq_state: None,
        }
    }
}

/// Lightweight summary returned to callers after enqueue or replay.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobHandle {
    pub job_id: JobId,
    pub intent_id: IntentId,
    pub accepted: bool,
    pub merged_into: Option<JobId>,
}

impl JobHandle {
    pub fn accepted(job: &Job) -> Self {
        Self {
            job_id: job.id,
            intent_id: job.intent.intent_id.clone(),
            accepted: true,
            merged_into: None,
        }
    }

    pub fn merged(existing: JobId, intent_id: IntentId) -> Self {
        Self {
            job_id: existing,
            intent_id,
            accepted: false,
            merged_into: Some(existing),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn intent() -> Intent {
        Intent::new("intent-1", "slack", "#general", "post_message")
            .with_payload(json!({"text": "hello"}))
    }

    #[test]
    fn new_job_starts_queued_at_version_one() {
        let now = Utc::now();
        let job = Job::new(intent(), now).with_context("campaign-7");
        assert_eq!(job.state, JobState::Queued);
        assert_eq!(job.job_version, 1);
        assert_eq!(job.attempt_count, 0);
        assert!(job.leased_by.is_none() && job.lease_until.is_none());
        assert_eq!(job.route_key(), "slack:#general");
        assert_eq!(job.available_at, now);
    }

    #[test]
    fn replay_child_tracks_lineage_and_resets_attempts() {
        let now = Utc::now();
        let mut parent = Job::new(intent(), now)
            .with_priority(2.5)
            .with_reservation("tokens", -40.0);
        parent.attempt_count = 3;
        parent.state = JobState::Dlq;
        parent.dlq_state = Some(DlqState::AwaitingManualAction);

        let child = parent.replay_child(now);
        assert_ne!(child.id, parent.id);
        assert_eq!(child.job_version, 2);
        assert_eq!(child.parent_job_id, Some(parent.id));
        assert_eq!(child.attempt_count, 0);
        assert_eq!(child.state, JobState::Queued);
        assert_eq!(child.dlq_state, None);
        assert_eq!(child.priority, 2.5);
        assert_eq!(child.reservation_delta, parent.reservation_delta);
        assert_ne!(child.idempotency_key(), parent.idempotency_key());
    }

    #[test]
    fn validate_rejects_nan_priority_and_zero_attempts() {
        let now = Utc::now();
        assert!(matches!(
            Job::new(intent(), now).with_priority(f64::NAN).validate(),
            Err(ExecutionError::Validation(_))
        ));
        assert!(matches!(
            Job::new(intent(), now).with_max_attempts(0).validate(),
            Err(ExecutionError::Validation(_))
        ));
        assert!(Job::new(intent(), now).validate().is_ok());
    }

    #[test]
    fn malformed_job_id_is_a_validation_error() {
        let err = JobId::from_str("not-a-uuid").unwrap_err();
        assert!(matches!(err, ExecutionError::Validation(_)));
        assert!(!err.is_lease_conflict());
        let id = JobId::new();
        assert_eq!(JobId::from_str(&id.to_string()).unwrap(), id);
    }
}
