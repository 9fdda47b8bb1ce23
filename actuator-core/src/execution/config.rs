use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Global knobs that tune the execution runtime.
///
/// All fields carry defaults so deployments can override a single section
/// without supplying a full configuration payload.
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Lease defaults (visibility timeout, batch size, housekeeping cadence).
    pub lease: LeaseConfig,
    /// Retry/backoff policy for environment failures.
    pub retry: RetryConfig,
    /// Per-route failure isolation.
    pub circuit: CircuitBreakerConfig,
    /// Hard sliding-window admission limits.
    pub rate_limit: RateLimitConfig,
    /// Soft AIMD pacing applied before a job is attempted.
    pub adaptive: AdaptiveConfig,
    /// Staleness policy for in-progress idempotency records.
    pub idempotency: IdempotencyConfig,
    /// Result delivery back to the producer.
    pub dispatcher: DispatcherConfig,
    /// Worker pool supervision.
    pub supervisor: SupervisorConfig,
}

/// Lease/heartbeat tuning for worker loops.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseConfig {
    /// Lease validity without a heartbeat (seconds).
    pub visibility_timeout_secs: i64,
    /// Jobs leased per worker cycle.
    pub batch_size: usize,
    /// Sleep between cycles when the queue is empty (ms).
    pub idle_poll_ms: u64,
    /// Backoff after a lease error before polling again (ms).
    pub error_backoff_ms: u64,
    /// Housekeeping cadence for reclaiming expired leases (ms).
    pub housekeeper_interval_ms: u64,
    /// Completed jobs and acknowledged results older than this are removed
    /// by housekeeping (seconds).
    pub retention_secs: i64,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            visibility_timeout_secs: 60,
            batch_size: 8,
            idle_poll_ms: 250,
            error_backoff_ms: 1_000,
            housekeeper_interval_ms: 15_000,
            retention_secs: 86_400,
        }
    }
}

impl LeaseConfig {
    pub fn visibility_timeout(&self) -> chrono::Duration {
        crate::clock::seconds(self.visibility_timeout_secs)
    }

    pub fn retention(&self) -> chrono::Duration {
        crate::clock::seconds(self.retention_secs)
    }

    pub fn idle_poll(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.idle_poll_ms)
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    /// Exponential growth factor applied per attempt.
    pub factor: f64,
    pub max_delay_ms: u64,
    /// Symmetric jitter as a fraction of the capped delay.
    pub jitter_ratio: f64,
    /// Floor for any computed delay.
    pub min_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 2_000,
            factor: 2.0,
            max_delay_ms: 5 * 60 * 1_000,
            jitter_ratio: 0.2,
            min_delay_ms: 100,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Failures inside `window_secs` that open the circuit.
    pub failure_threshold: usize,
    pub window_secs: i64,
    /// Time an open circuit waits before admitting a half-open trial call.
    pub cooldown_secs: i64,
    /// Consecutive trial successes required to close again.
    pub half_open_success_threshold: u32,
    /// A trial call that has not reported back after this long is presumed
    /// lost and its slot handed to the next caller.
    pub trial_timeout_secs: i64,
    /// Delay applied when a job is deferred by an open circuit (ms).
    pub deferral_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            window_secs: 30,
            cooldown_secs: 60,
            half_open_success_threshold: 2,
            trial_timeout_secs: 300,
            deferral_ms: 5_000,
        }
    }
}

/// One sliding window: at most `max_events` inside `window_secs`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct WindowLimit {
    pub max_events: usize,
    pub window_secs: i64,
}

impl WindowLimit {
    pub const fn new(max_events: usize, window_secs: i64) -> Self {
        Self {
            max_events,
            window_secs,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Limit across every route. `None` disables the global scope.
    pub global: Option<WindowLimit>,
    /// Default limit applied to each route key.
    pub per_route: Option<WindowLimit>,
    /// Route-specific overrides keyed by `platform:target`.
    pub route_overrides: HashMap<String, WindowLimit>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            global: Some(WindowLimit::new(600, 60)),
            per_route: Some(WindowLimit::new(30, 60)),
            route_overrides: HashMap::new(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptiveConfig {
    /// Additive step (seconds) applied on pressure and subtracted on success.
    pub step_secs: f64,
    /// Multiplier applied to the current delay on pressure failures.
    pub multiplier: f64,
    pub max_delay_secs: f64,
    /// Extra spacing per second of queue lag while a route is throttled.
    pub lag_penalty_per_sec: f64,
    /// Case-insensitive substrings in a failure reason that mark the
    /// failure as environment pressure.
    pub pressure_signatures: Vec<String>,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            step_secs: 1.0,
            multiplier: 0.5,
            max_delay_secs: 120.0,
            lag_penalty_per_sec: 0.01,
            pressure_signatures: [
                "rate limit",
                "rate-limit",
                "too many requests",
                "429",
                "500",
                "502",
                "503",
                "504",
                "server error",
                "unavailable",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct IdempotencyConfig {
    /// An in-progress record older than this is treated as an unknown outcome.
    pub stale_after_secs: i64,
    /// Delay applied when a fresh in-progress record defers a job (ms).
    pub in_progress_deferral_ms: u64,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            stale_after_secs: 15 * 60,
            in_progress_deferral_ms: 10_000,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    pub batch_size: usize,
    pub visibility_timeout_secs: i64,
    /// Fallback polling interval when no notification arrives (ms).
    pub poll_interval_ms: u64,
    /// Maximum acceptable latency between a result being produced and applied.
    pub sla_ms: i64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            batch_size: 32,
            visibility_timeout_secs: 30,
            poll_interval_ms: 2_000,
            sla_ms: 5_000,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub worker_count: usize,
    /// Cadence of liveness and heartbeat staleness checks (ms).
    pub check_interval_ms: u64,
    /// Bound on waiting for each loop during shutdown (ms).
    pub shutdown_timeout_ms: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            check_interval_ms: 5_000,
            shutdown_timeout_ms: 30_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn partial_overrides_keep_remaining_defaults() {
        let cfg: ExecutionConfig = serde_json::from_value(json!({
            "retry": { "max_attempts": 2 },
            "circuit": { "cooldown_secs": 5 }
        }))
        .unwrap();

        assert_eq!(cfg.retry.max_attempts, 2);
        assert_eq!(cfg.retry.min_delay_ms, 100);
        assert_eq!(cfg.circuit.cooldown_secs, 5);
        assert_eq!(cfg.circuit.failure_threshold, 3);
        assert_eq!(cfg.supervisor.worker_count, 4);
        assert!(cfg.rate_limit.global.is_some());
    }
}
