use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::job::{IntentId, Job, JobId, ReservationDelta};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Success,
    Failed,
    Partial,
    Rejected,
}

/// Failure classification reported by adapters. The worker only ever
/// branches on this and on [`ExecutionStatus`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureType {
    Policy,
    Environment,
    Internal,
    None,
}

impl fmt::Display for FailureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FailureType::Policy => "policy",
            FailureType::Environment => "environment",
            FailureType::Internal => "internal",
            FailureType::None => "none",
        };
        f.write_str(label)
    }
}

/// Outcome of one adapter invocation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub status: ExecutionStatus,
    #[serde(default)]
    pub effects: Vec<Value>,
    #[serde(default)]
    pub costs: BTreeMap<String, f64>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub observations: Value,
    pub failure_type: FailureType,
    #[serde(default)]
    pub reason: Option<String>,
}

impl ExecutionResult {
    pub fn success() -> Self {
        Self {
            status: ExecutionStatus::Success,
            effects: Vec::new(),
            costs: BTreeMap::new(),
            observations: Value::Null,
            failure_type: FailureType::None,
            reason: None,
        }
    }

    pub fn failure(
        status: ExecutionStatus,
        failure_type: FailureType,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            status,
            effects: Vec::new(),
            costs: BTreeMap::new(),
            observations: Value::Null,
            failure_type,
            reason: Some(reason.into()),
        }
    }

    /// Retryable infrastructure failure (timeouts, 5xx, throttling).
    pub fn environment(reason: impl Into<String>) -> Self {
        Self::failure(ExecutionStatus::Failed, FailureType::Environment, reason)
    }

    pub fn internal(reason: impl Into<String>) -> Self {
        Self::failure(ExecutionStatus::Failed, FailureType::Internal, reason)
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::failure(ExecutionStatus::Rejected, FailureType::Policy, reason)
    }

    pub fn with_effect(mut self, effect: Value) -> Self {
        self.effects.push(effect);
        self
    }

    pub fn with_cost(mut self, key: impl Into<String>, amount: f64) -> Self {
        self.costs.insert(key.into(), amount);
        self
    }

    pub fn with_observations(mut self, observations: Value) -> Self {
        self.observations = observations;
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Success
    }

    pub fn is_environment_failure(&self) -> bool {
        !self.is_success() && self.failure_type == FailureType::Environment
    }

    pub fn reason_or_default(&self) -> String {
        self.reason
            .clone()
            .unwrap_or_else(|| format!("{:?}/{}", self.status, self.failure_type))
    }
}

/// Unique identifier for result envelopes stored in the inbox.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct EnvelopeId(pub Uuid);

impl Default for EnvelopeId {
    fn default() -> Self {
        Self::new()
    }
}

impl EnvelopeId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl fmt::Display for EnvelopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Terminal outcome of a job, carried back to the producer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResultEnvelope {
    pub job_id: JobId,
    pub intent_id: IntentId,
    pub context_key: String,
    #[serde(default)]
    pub reservation_delta: ReservationDelta,
    pub result: ExecutionResult,
    pub received_at: DateTime<Utc>,
}

impl ResultEnvelope {
    pub fn for_job(job: &Job, result: ExecutionResult, received_at: DateTime<Utc>) -> Self {
        Self {
            job_id: job.id,
            intent_id: job.intent.intent_id.clone(),
            context_key: job.context_key.clone(),
            reservation_delta: job.reservation_delta.clone(),
            result,
            received_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::job::Intent;
    use serde_json::json;

    #[test]
    fn only_non_success_environment_results_are_retryable() {
        assert!(ExecutionResult::environment("503 upstream").is_environment_failure());
        assert!(!ExecutionResult::internal("bad state").is_environment_failure());
        assert!(!ExecutionResult::rejected("policy").is_environment_failure());

        let mut odd = ExecutionResult::success();
        odd.failure_type = FailureType::Environment;
        assert!(!odd.is_environment_failure());

        let partial = ExecutionResult::failure(
            ExecutionStatus::Partial,
            FailureType::Environment,
            "half the batch timed out",
        );
        assert!(partial.is_environment_failure());
    }

    #[test]
    fn envelope_carries_job_reservation_and_context() {
        let job = Job::new(Intent::new("i-9", "x", "acct", "post"), Utc::now())
            .with_context("ctx")
            .with_reservation("budget", -3.0);
        let env = ResultEnvelope::for_job(&job, ExecutionResult::success(), Utc::now());
        assert_eq!(env.job_id, job.id);
        assert_eq!(env.intent_id.as_str(), "i-9");
        assert_eq!(env.context_key, "ctx");
        assert_eq!(env.reservation_delta.get("budget"), Some(&-3.0));
    }

    #[test]
    fn adapter_wire_format_uses_upper_case_tags() {
        let raw = json!({
            "status": "REJECTED",
            "failure_type": "POLICY",
            "reason": "content policy"
        });
        let parsed: ExecutionResult = serde_json::from_value(raw).unwrap();
        assert_eq!(parsed.status, ExecutionStatus::Rejected);
        assert_eq!(parsed.failure_type, FailureType::Policy);
        assert!(parsed.effects.is_empty());
    }
}
