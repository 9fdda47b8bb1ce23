//! Per-route circuit breaker with single-caller half-open recovery.
//!
//! Closed routes keep a rolling window of failure timestamps. Once the
//! window holds `failure_threshold` entries the route opens. After the
//! cooldown one caller is admitted as the half-open trial; further callers
//! are refused until that trial reports back or outlives
//! `trial_timeout_secs`. Enough consecutive trial successes close the route
//! again, and a single trial failure reopens it.

use std::collections::{HashMap, VecDeque};
use std::fmt;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::clock::{self, SharedClock};

use super::config::CircuitBreakerConfig;

/// Undrained transitions kept per breaker; the oldest are dropped first.
pub const MAX_PENDING_EVENTS: usize = 1_024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Answer to an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Denied,
    Admitted,
    /// Admitted as the single half-open trial. The caller owns the slot
    /// until it records an outcome or calls [`CircuitBreaker::cancel_trial`].
    Trial,
}

impl Admission {
    pub fn is_admitted(self) -> bool {
        self != Admission::Denied
    }
}

/// Immutable record of one state transition.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitEvent {
    pub route: String,
    pub from: CircuitState,
    pub to: CircuitState,
    pub at: DateTime<Utc>,
    pub reason: String,
}

#[derive(Debug)]
struct RouteCircuit {
    state: CircuitState,
    failures: VecDeque<DateTime<Utc>>,
    opened_at: Option<DateTime<Utc>>,
    trial_started_at: Option<DateTime<Utc>>,
    trial_successes: u32,
}

impl Default for RouteCircuit {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            failures: VecDeque::new(),
            opened_at: None,
            trial_started_at: None,
            trial_successes: 0,
        }
    }
}

#[derive(Default)]
struct Inner {
    routes: HashMap<String, RouteCircuit>,
    events: VecDeque<CircuitEvent>,
    dropped_events: u64,
}

pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    clock: SharedClock,
    inner: Mutex<Inner>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("CircuitBreaker")
            .field("routes", &inner.routes.len())
            .field("pending_events", &inner.events.len())
            .field("dropped_events", &inner.dropped_events)
            .finish()
    }
}

impl Inner {
    fn transition(
        &mut self,
        route: &str,
        to: CircuitState,
        now: DateTime<Utc>,
        reason: &str,
    ) {
        let circuit = self.routes.entry(route.to_string()).or_default();
        let from = circuit.state;
        circuit.state = to;
        circuit.trial_started_at = None;
        circuit.trial_successes = 0;
        match to {
            CircuitState::Open => circuit.opened_at = Some(now),
            CircuitState::Closed => {
                circuit.opened_at = None;
                circuit.failures.clear();
            }
            CircuitState::HalfOpen => {}
        }
        if self.events.len() >= MAX_PENDING_EVENTS {
            self.events.pop_front();
            self.dropped_events += 1;
        }
        self.events.push_back(CircuitEvent {
            route: route.to_string(),
            from,
            to,
            at: now,
            reason: reason.to_string(),
        });
    }
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig, clock: SharedClock) -> Self {
        Self {
            config,
            clock,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn state(&self, route: &str) -> CircuitState {
        self.inner
            .lock()
            .routes
            .get(route)
            .map(|c| c.state)
            .unwrap_or(CircuitState::Closed)
    }

    /// Admission check as a plain yes/no. A half-open `true` still makes the
    /// caller the trial; prefer [`CircuitBreaker::admit`] when the caller
    /// has to hand the slot back.
    pub fn allow(&self, route: &str) -> bool {
        self.admit(route).is_admitted()
    }

    pub fn admit(&self, route: &str) -> Admission {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        let circuit = inner.routes.entry(route.to_string()).or_default();

        match circuit.state {
            CircuitState::Closed => Admission::Admitted,
            CircuitState::Open => {
                let cooled = circuit
                    .opened_at
                    .is_none_or(|at| now - at >= clock::seconds(self.config.cooldown_secs));
                if !cooled {
                    return Admission::Denied;
                }
                inner.transition(route, CircuitState::HalfOpen, now, "cooldown elapsed");
                if let Some(circuit) = inner.routes.get_mut(route) {
                    circuit.trial_started_at = Some(now);
                }
                info!(route, "circuit half-open, admitting trial call");
                Admission::Trial
            }
            CircuitState::HalfOpen => match circuit.trial_started_at {
                None => {
                    circuit.trial_started_at = Some(now);
                    Admission::Trial
                }
                Some(started)
                    if now - started >= clock::seconds(self.config.trial_timeout_secs) =>
                {
                    warn!(route, %started, "half-open trial never reported back; admitting another");
                    circuit.trial_started_at = Some(now);
                    Admission::Trial
                }
                Some(_) => Admission::Denied,
            },
        }
    }

    /// Hands back a half-open trial slot that was never executed.
    pub fn cancel_trial(&self, route: &str) {
        let mut inner = self.inner.lock();
        if let Some(circuit) = inner.routes.get_mut(route)
            && circuit.state == CircuitState::HalfOpen
        {
            circuit.trial_started_at = None;
        }
    }

    pub fn record_success(&self, route: &str) {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        let circuit = inner.routes.entry(route.to_string()).or_default();

        match circuit.state {
            CircuitState::Closed => circuit.failures.clear(),
            CircuitState::HalfOpen => {
                circuit.trial_started_at = None;
                circuit.trial_successes += 1;
                if circuit.trial_successes >= self.config.half_open_success_threshold {
                    info!(
                        route,
                        successes = circuit.trial_successes,
                        "circuit closing after successful trials"
                    );
                    inner.transition(route, CircuitState::Closed, now, "trials succeeded");
                }
            }
            CircuitState::Open => {
                debug!(route, "success recorded while circuit open");
            }
        }
    }

    pub fn record_failure(&self, route: &str) {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        let circuit = inner.routes.entry(route.to_string()).or_default();

        match circuit.state {
            CircuitState::Closed => {
                let horizon = clock::saturating_sub(now, clock::seconds(self.config.window_secs));
                circuit.failures.push_back(now);
                while circuit.failures.front().is_some_and(|ts| *ts <= horizon) {
                    circuit.failures.pop_front();
                }
                if circuit.failures.len() >= self.config.failure_threshold {
                    warn!(
                        route,
                        failures = circuit.failures.len(),
                        "circuit opening due to failures"
                    );
                    inner.transition(route, CircuitState::Open, now, "failure threshold reached");
                }
            }
            CircuitState::HalfOpen => {
                warn!(route, "circuit re-opening after trial failure");
                inner.transition(route, CircuitState::Open, now, "trial failed");
            }
            CircuitState::Open => {}
        }
    }

    /// Removes and returns every transition recorded since the last drain.
    pub fn drain_events(&self) -> Vec<CircuitEvent> {
        let mut inner = self.inner.lock();
        if inner.dropped_events > 0 {
            warn!(dropped = inner.dropped_events, "circuit events dropped before drain");
            inner.dropped_events = 0;
        }
        inner.events.drain(..).collect()
    }
}
