//! # Actuator Core
//!
//! Execution runtime that turns approved agent intents into side effects on
//! external platforms, safely and observably.
//!
//! ## Overview
//!
//! - **Leased queue**: at most one active job per intent, priority ordered
//!   leasing with visibility timeouts and crash recovery
//! - **Gated workers**: adaptive pacing, per-route circuit breakers, sliding
//!   window rate limits and idempotency checks before any adapter call
//! - **Dead-letter queue**: operator replay and resolution with lineage
//! - **Result delivery**: terminal results land in an inbox and are applied
//!   to the producer at least once, with SLA tracking
//!
//! ## Feature Flags
//!
//! - `database`: Postgres backings for every store (enabled by default)
//! - `postgres-tests`: integration tests against a live database
//!
//! ## Examples
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use actuator_core::execution::{
//!     ExecutionConfig, ExecutionRuntime, Intent, ResultApplier, ResultEnvelope,
//! };
//!
//! struct Producer;
//!
//! #[async_trait::async_trait]
//! impl ResultApplier for Producer {
//!     async fn apply_result(&self, envelope: &ResultEnvelope) -> actuator_core::Result<()> {
//!         println!("{} finished: {:?}", envelope.job_id, envelope.result.status);
//!         Ok(())
//!     }
//! }
//!
//! async fn run() -> actuator_core::Result<()> {
//!     let runtime = ExecutionRuntime::builder(ExecutionConfig::default())
//!         .with_applier(Arc::new(Producer))
//!         .build()?;
//!     runtime.start().await?;
//!     let job = runtime.new_job(Intent::new("intent-1", "x", "acct-1", "post"));
//!     runtime.enqueue(job).await?;
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod clock;
pub mod error;
pub mod execution;

pub use error::{ExecutionError, Result};

#[cfg(feature = "database")]
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");
