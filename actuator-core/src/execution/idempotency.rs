use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::clock::SharedClock;
use crate::error::{ExecutionError, Result};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdempotencyState {
    InProgress,
    Done,
}

impl IdempotencyState {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdempotencyState::InProgress => "in_progress",
            IdempotencyState::Done => "done",
        }
    }
}

impl fmt::Display for IdempotencyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IdempotencyState {
    type Err = ExecutionError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "in_progress" => Ok(IdempotencyState::InProgress),
            "done" => Ok(IdempotencyState::Done),
            other => Err(ExecutionError::Internal(format!(
                "unknown idempotency state {other}"
            ))),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub key: String,
    pub state: IdempotencyState,
    pub updated_at: DateTime<Utc>,
    /// Opaque completion metadata; the worker stores the terminal result here.
    #[serde(default)]
    pub metadata: Value,
}

/// Result of [`IdempotencyStore::begin`].
#[derive(Clone, Debug, PartialEq)]
pub enum BeginOutcome {
    /// First caller. A fresh in-progress record now guards the key.
    New,
    /// Another attempt holds the key. `stale` means it has not been touched
    /// within the staleness window and its outcome is unknown.
    InProgress {
        stale: bool,
        since: DateTime<Utc>,
    },
    /// Side effect already performed.
    Done(IdempotencyRecord),
}

#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    async fn begin(&self, key: &str) -> Result<BeginOutcome>;

    async fn complete(&self, key: &str, metadata: Value) -> Result<()>;

    /// Rolls back an in-progress record. Done records are left untouched.
    async fn clear_in_progress(&self, key: &str) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<IdempotencyRecord>>;
}

pub struct InMemoryIdempotencyStore {
    records: Mutex<HashMap<String, IdempotencyRecord>>,
    stale_after: Duration,
    clock: SharedClock,
}

impl fmt::Debug for InMemoryIdempotencyStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryIdempotencyStore")
            .field("records", &self.records.lock().len())
            .field("stale_after", &self.stale_after)
            .finish()
    }
}

impl InMemoryIdempotencyStore {
    pub fn new(stale_after: Duration, clock: SharedClock) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            stale_after,
            clock,
        }
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn begin(&self, key: &str) -> Result<BeginOutcome> {
        let now = self.clock.now();
        let mut records = self.records.lock();
        match records.get(key) {
            Some(record) if record.state == IdempotencyState::Done => {
                Ok(BeginOutcome::Done(record.clone()))
            }
            Some(record) => Ok(BeginOutcome::InProgress {
                stale: now - record.updated_at >= self.stale_after,
                since: record.updated_at,
            }),
            None => {
                records.insert(
                    key.to_string(),
                    IdempotencyRecord {
                        key: key.to_string(),
                        state: IdempotencyState::InProgress,
                        updated_at: now,
                        metadata: Value::Null,
                    },
                );
                Ok(BeginOutcome::New)
            }
        }
    }

    async fn complete(&self, key: &str, metadata: Value) -> Result<()> {
        let now = self.clock.now();
        self.records.lock().insert(
            key.to_string(),
            IdempotencyRecord {
                key: key.to_string(),
                state: IdempotencyState::Done,
                updated_at: now,
                metadata,
            },
        );
        Ok(())
    }

    async fn clear_in_progress(&self, key: &str) -> Result<()> {
        let mut records = self.records.lock();
        if records
            .get(key)
            .is_some_and(|r| r.state == IdempotencyState::InProgress)
        {
            records.remove(key);
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<IdempotencyRecord>> {
        Ok(self.records.lock().get(key).cloned())
    }
}
