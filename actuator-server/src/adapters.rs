//! Adapters and producer callbacks wired in by the server when no real
//! platform integrations are configured.

use std::sync::atomic::{AtomicU64, Ordering};

use actuator_core::execution::{
    AdapterError, ExecutionAdapter, ExecutionResult, Intent, ResultApplier, ResultEnvelope,
};
use async_trait::async_trait;
use serde_json::json;
use tracing::info;

/// Logs the intent and reports success without touching any platform.
#[derive(Debug, Clone)]
pub struct DryRunAdapter {
    platform: String,
}

impl DryRunAdapter {
    pub fn new(platform: impl Into<String>) -> Self {
        Self {
            platform: platform.into(),
        }
    }
}

#[async_trait]
impl ExecutionAdapter for DryRunAdapter {
    async fn execute(&self, intent: &Intent) -> Result<ExecutionResult, AdapterError> {
        info!(
            platform = %self.platform,
            intent = %intent.intent_id,
            target = %intent.target,
            action = %intent.action,
            "dry run execution"
        );
        Ok(ExecutionResult::success().with_effect(json!({
            "dry_run": true,
            "platform": self.platform,
            "target": intent.target,
            "action": intent.action,
        })))
    }
}

/// Default producer callback: logs every envelope and counts applications.
#[derive(Debug, Default)]
pub struct LoggingResultApplier {
    applied: AtomicU64,
}

impl LoggingResultApplier {
    pub fn applied(&self) -> u64 {
        self.applied.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ResultApplier for LoggingResultApplier {
    async fn apply_result(&self, envelope: &ResultEnvelope) -> actuator_core::Result<()> {
        self.applied.fetch_add(1, Ordering::Relaxed);
        info!(
            job = %envelope.job_id,
            intent = %envelope.intent_id,
            context = %envelope.context_key,
            status = ?envelope.result.status,
            failure_type = %envelope.result.failure_type,
            "result applied"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use actuator_core::execution::{ExecutionStatus, Job};
    use chrono::Utc;

    use super::*;

    #[tokio::test]
    async fn dry_run_reports_success_with_effect() {
        let adapter = DryRunAdapter::new("slack");
        let result = adapter
            .execute(&Intent::new("i", "slack", "#ops", "post"))
            .await
            .unwrap();
        assert_eq!(result.status, ExecutionStatus::Success);
        assert_eq!(result.effects[0]["target"], "#ops");
    }

    #[tokio::test]
    async fn logging_applier_counts() {
        let applier = LoggingResultApplier::default();
        let job = Job::new(Intent::new("i", "slack", "#ops", "post"), Utc::now());
        let envelope = ResultEnvelope::for_job(&job, ExecutionResult::success(), Utc::now());
        applier.apply_result(&envelope).await.unwrap();
        applier.apply_result(&envelope).await.unwrap();
        assert_eq!(applier.applied(), 2);
    }
}
