//! Execution runtime: a leased job queue feeding a gated worker pipeline,
//! with a dead-letter queue and at-least-once result delivery back to the
//! producer.
//!
//! Every store sits behind a trait so the in-memory backings used by tests
//! and single-process deployments can be swapped for the Postgres ones in
//! [`persistence`].

pub mod adapter;
pub mod adaptive;
pub mod circuit;
pub mod config;
pub mod dispatcher;
pub mod events;
pub mod heartbeat;
pub mod idempotency;
pub mod inbox;
pub mod job;
#[cfg(feature = "database")]
#[cfg_attr(docsrs, doc(cfg(feature = "database")))]
pub mod persistence;
pub mod queue;
pub mod rate_limit;
pub mod result;
pub mod retry;
pub mod runtime;
pub mod supervisor;
pub mod worker;

pub use adapter::*;
pub use adaptive::*;
pub use circuit::*;
pub use config::*;
pub use dispatcher::*;
pub use events::*;
pub use heartbeat::*;
pub use idempotency::*;
pub use inbox::*;
pub use job::*;
#[cfg(feature = "database")]
pub use persistence::*;
pub use queue::*;
pub use rate_limit::*;
pub use result::*;
pub use retry::*;
pub use runtime::*;
pub use supervisor::*;
pub use worker::*;
