//! Soft per-route pacing driven by downstream pressure.
//!
//! Each route carries a delay that acts as the minimum spacing between
//! consecutive sends. A pressure failure scales the delay by the configured
//! multiplier (halving by default) and then adds a fixed step; successes
//! subtract the step. The delay stays within `[0, max_delay_secs]`.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::clock;

use super::config::AdaptiveConfig;
use super::result::ExecutionResult;

#[derive(Clone, Debug, Default)]
struct RouteState {
    delay_secs: f64,
    last_sent_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AdaptiveRouteSnapshot {
    pub route: String,
    pub delay_secs: f64,
    pub last_sent_at: Option<DateTime<Utc>>,
}

pub struct AdaptiveRateController {
    config: AdaptiveConfig,
    routes: Mutex<HashMap<String, RouteState>>,
}

impl fmt::Debug for AdaptiveRateController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdaptiveRateController")
            .field("routes", &self.routes.lock().len())
            .field("max_delay_secs", &self.config.max_delay_secs)
            .finish()
    }
}

impl AdaptiveRateController {
    pub fn new(config: AdaptiveConfig) -> Self {
        Self {
            config,
            routes: Mutex::new(HashMap::new()),
        }
    }

    /// Whether a failure reason carries one of the configured pressure
    /// signatures (throttling, server errors).
    pub fn is_pressure_failure(&self, result: &ExecutionResult) -> bool {
        if !result.is_environment_failure() {
            return false;
        }
        let Some(reason) = result.reason.as_deref() else {
            return false;
        };
        let reason = reason.to_ascii_lowercase();
        self.config
            .pressure_signatures
            .iter()
            .any(|sig| reason.contains(&sig.to_ascii_lowercase()))
    }

    pub fn current_delay(&self, route: &str) -> f64 {
        self.routes
            .lock()
            .get(route)
            .map(|s| s.delay_secs)
            .unwrap_or(0.0)
    }

    /// Remaining wait before `route` may send again. Queue lag only adds a
    /// penalty while the route is already throttled.
    pub fn pre_send_delay(&self, route: &str, queue_lag: Duration, now: DateTime<Utc>) -> Duration {
        let routes = self.routes.lock();
        let Some(state) = routes.get(route) else {
            return Duration::zero();
        };
        if state.delay_secs <= 0.0 {
            return Duration::zero();
        }
        let Some(last) = state.last_sent_at else {
            return Duration::zero();
        };

        let lag_secs = (queue_lag.num_milliseconds().max(0) as f64) / 1_000.0;
        let spacing = state.delay_secs + lag_secs * self.config.lag_penalty_per_sec;
        let ready_at = clock::saturating_add(last, secs_to_duration(spacing.min(self.config.max_delay_secs)));
        (ready_at - now).max(Duration::zero())
    }

    pub fn record_send(&self, route: &str, now: DateTime<Utc>) {
        self.routes
            .lock()
            .entry(route.to_string())
            .or_default()
            .last_sent_at = Some(now);
    }

    pub fn record_success(&self, route: &str) {
        let mut routes = self.routes.lock();
        if let Some(state) = routes.get_mut(route) {
            state.delay_secs = (state.delay_secs - self.config.step_secs).max(0.0);
        }
    }

    /// Applies pressure feedback. Non-pressure failures leave the delay alone.
    pub fn record_failure(&self, route: &str, result: &ExecutionResult) {
        if !self.is_pressure_failure(result) {
            return;
        }
        let mut routes = self.routes.lock();
        let state = routes.entry(route.to_string()).or_default();
        let grown = state.delay_secs * self.config.multiplier.max(0.0) + self.config.step_secs;
        state.delay_secs = grown.min(self.config.max_delay_secs).max(0.0);
        if state.delay_secs >= self.config.max_delay_secs {
            info!(route, delay_secs = state.delay_secs, "adaptive delay at maximum");
        } else {
            debug!(route, delay_secs = state.delay_secs, "adaptive delay increased");
        }
    }

    pub fn snapshot(&self) -> Vec<AdaptiveRouteSnapshot> {
        let mut out: Vec<_> = self
            .routes
            .lock()
            .iter()
            .map(|(route, state)| AdaptiveRouteSnapshot {
                route: route.clone(),
                delay_secs: state.delay_secs,
                last_sent_at: state.last_sent_at,
            })
            .collect();
        out.sort_by(|a, b| a.route.cmp(&b.route));
        out
    }
}

fn secs_to_duration(secs: f64) -> Duration {
    Duration::milliseconds((secs.max(0.0) * 1_000.0).round() as i64)
}
