//! Contracts toward the external platforms.
//!
//! Adapters only report outcomes through [`ExecutionResult`]; the worker
//! never looks past the status and failure classification. Errors and
//! panics escaping an adapter are normalised into internal failures by the
//! worker.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use super::job::Intent;
use super::result::ExecutionResult;

#[derive(Error, Debug)]
pub enum AdapterError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid intent: {0}")]
    InvalidIntent(String),

    #[error("{0}")]
    Other(String),
}

#[async_trait]
pub trait ExecutionAdapter: Send + Sync {
    async fn execute(&self, intent: &Intent) -> Result<ExecutionResult, AdapterError>;
}

/// Produces the final payload right before execution (rendering, media
/// uploads). On failure the intent's fallback payload is used instead.
#[async_trait]
pub trait ContentMaterializer: Send + Sync {
    async fn materialize(&self, intent: &Intent) -> Result<Value, AdapterError>;
}

/// Platform name to adapter map, resolved once at composition time.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<String, Arc<dyn ExecutionAdapter>>,
}

impl fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("platforms", &self.platforms())
            .finish()
    }
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_adapter(
        mut self,
        platform: impl Into<String>,
        adapter: Arc<dyn ExecutionAdapter>,
    ) -> Self {
        self.register(platform, adapter);
        self
    }

    pub fn register(&mut self, platform: impl Into<String>, adapter: Arc<dyn ExecutionAdapter>) {
        self.adapters.insert(platform.into(), adapter);
    }

    pub fn get(&self, platform: &str) -> Option<Arc<dyn ExecutionAdapter>> {
        self.adapters.get(platform).cloned()
    }

    pub fn platforms(&self) -> Vec<String> {
        let mut names: Vec<_> = self.adapters.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed;

    #[async_trait]
    impl ExecutionAdapter for Fixed {
        async fn execute(&self, _intent: &Intent) -> Result<ExecutionResult, AdapterError> {
            Ok(ExecutionResult::success())
        }
    }

    #[tokio::test]
    async fn registry_resolves_by_platform() {
        let registry = AdapterRegistry::new()
            .with_adapter("slack", Arc::new(Fixed))
            .with_adapter("email", Arc::new(Fixed));
        assert_eq!(registry.platforms(), vec!["email", "slack"]);
        assert!(registry.get("sms").is_none());

        let adapter = registry.get("slack").unwrap();
        let result = adapter
            .execute(&Intent::new("i", "slack", "#ops", "post"))
            .await
            .unwrap();
        assert!(result.is_success());
    }
}
