use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::clock::SharedClock;
use crate::error::Result;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerHeartbeat {
    pub worker_id: String,
    pub updated_at: DateTime<Utc>,
    pub status: String,
}

/// Liveness record per worker, overwritten on every beat.
#[async_trait]
pub trait HeartbeatStore: Send + Sync {
    async fn beat(&self, worker_id: &str, status: &str) -> Result<()>;

    async fn get(&self, worker_id: &str) -> Result<Option<WorkerHeartbeat>>;

    async fn list(&self) -> Result<Vec<WorkerHeartbeat>>;
}

pub struct InMemoryHeartbeatStore {
    beats: Mutex<HashMap<String, WorkerHeartbeat>>,
    clock: SharedClock,
}

impl fmt::Debug for InMemoryHeartbeatStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryHeartbeatStore")
            .field("workers", &self.beats.lock().len())
            .finish()
    }
}

impl InMemoryHeartbeatStore {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            beats: Mutex::new(HashMap::new()),
            clock,
        }
    }
}

#[async_trait]
impl HeartbeatStore for InMemoryHeartbeatStore {
    async fn beat(&self, worker_id: &str, status: &str) -> Result<()> {
        let beat = WorkerHeartbeat {
            worker_id: worker_id.to_string(),
            updated_at: self.clock.now(),
            status: status.to_string(),
        };
        self.beats.lock().insert(worker_id.to_string(), beat);
        Ok(())
    }

    async fn get(&self, worker_id: &str) -> Result<Option<WorkerHeartbeat>> {
        Ok(self.beats.lock().get(worker_id).cloned())
    }

    async fn list(&self) -> Result<Vec<WorkerHeartbeat>> {
        let mut out: Vec<_> = self.beats.lock().values().cloned().collect();
        out.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::clock::{Clock, ManualClock};

    #[tokio::test]
    async fn beat_overwrites_previous_record() {
        let clock = ManualClock::default();
        let store = InMemoryHeartbeatStore::new(Arc::new(clock.clone()));
        store.beat("w-1", "idle").await.unwrap();
        clock.advance_secs(3);
        store.beat("w-1", "executing").await.unwrap();

        let beat = store.get("w-1").await.unwrap().unwrap();
        assert_eq!(beat.status, "executing");
        assert_eq!(beat.updated_at, clock.now());
        assert_eq!(store.list().await.unwrap().len(), 1);
    }
}
