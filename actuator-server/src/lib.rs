//! # Actuator Server
//!
//! Composition root for the execution runtime plus the operator HTTP
//! surface: enqueue, job lookup, DLQ replay and resolution, queue and SLA
//! metrics, circuit transitions, limiter snapshots and worker liveness.

pub mod adapters;
pub mod config;
pub mod errors;
pub mod routes;
pub mod startup;
