//! Hard sliding-window admission limits on outbound calls.
//!
//! Two scopes are checked together: a global window shared by every route
//! and one window per route key. A call is admitted only if both scopes
//! have room, and a rejected call consumes nothing.

use std::collections::{HashMap, VecDeque};
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::clock;

use super::config::{RateLimitConfig, WindowLimit};

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct RateDecision {
    pub allowed: bool,
    /// Seconds until the blocking window frees a slot. Zero when allowed.
    pub retry_after_secs: f64,
}

impl RateDecision {
    fn allow() -> Self {
        Self {
            allowed: true,
            retry_after_secs: 0.0,
        }
    }

    fn deny(retry_after: Duration) -> Self {
        let secs = retry_after.num_milliseconds().max(1) as f64 / 1_000.0;
        Self {
            allowed: false,
            retry_after_secs: secs,
        }
    }
}

/// Point-in-time view of one window, for operator telemetry.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WindowSnapshot {
    pub scope: String,
    pub used: usize,
    pub max_events: usize,
    pub window_secs: i64,
}

#[derive(Default)]
struct Windows {
    global: VecDeque<DateTime<Utc>>,
    routes: HashMap<String, VecDeque<DateTime<Utc>>>,
}

pub struct SlidingWindowRateLimiter {
    config: RateLimitConfig,
    windows: Mutex<Windows>,
}

impl fmt::Debug for SlidingWindowRateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let windows = self.windows.lock();
        f.debug_struct("SlidingWindowRateLimiter")
            .field("global_used", &windows.global.len())
            .field("routes", &windows.routes.len())
            .finish()
    }
}

fn trim(window: &mut VecDeque<DateTime<Utc>>, limit: &WindowLimit, now: DateTime<Utc>) {
    let horizon = clock::saturating_sub(now, clock::seconds(limit.window_secs));
    while window.front().is_some_and(|ts| *ts <= horizon) {
        window.pop_front();
    }
}

/// `None` when the window has room, otherwise the wait until it does.
fn blocked_for(
    window: &VecDeque<DateTime<Utc>>,
    limit: &WindowLimit,
    now: DateTime<Utc>,
) -> Option<Duration> {
    if window.len() < limit.max_events {
        return None;
    }
    let oldest = window.front().copied().unwrap_or(now);
    Some(clock::saturating_add(oldest, clock::seconds(limit.window_secs)) - now)
}

fn remove_latest(window: &mut VecDeque<DateTime<Utc>>, at: DateTime<Utc>) {
    if let Some(pos) = window.iter().rposition(|ts| *ts == at) {
        window.remove(pos);
    }
}

impl SlidingWindowRateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            windows: Mutex::new(Windows::default()),
        }
    }

    fn route_limit(&self, route: &str) -> Option<WindowLimit> {
        self.config
            .route_overrides
            .get(route)
            .copied()
            .or(self.config.per_route)
    }

    pub fn allow(&self, route: &str, now: DateTime<Utc>) -> RateDecision {
        let route_limit = self.route_limit(route);
        let mut windows = self.windows.lock();
        let Windows { global, routes } = &mut *windows;

        let mut wait: Option<Duration> = None;
        if let Some(limit) = self.config.global.as_ref() {
            trim(global, limit, now);
            wait = blocked_for(global, limit, now);
        }

        let route_window = routes.entry(route.to_string()).or_default();
        if let Some(limit) = route_limit.as_ref() {
            trim(route_window, limit, now);
            if let Some(route_wait) = blocked_for(route_window, limit, now) {
                wait = Some(wait.map_or(route_wait, |w| w.max(route_wait)));
            }
        }

        if let Some(wait) = wait {
            return RateDecision::deny(wait);
        }

        if self.config.global.is_some() {
            global.push_back(now);
        }
        if route_limit.is_some() {
            route_window.push_back(now);
        }
        RateDecision::allow()
    }

    /// Gives back a slot admitted at `at` for a call that was never made.
    pub fn refund(&self, route: &str, at: DateTime<Utc>) {
        let mut windows = self.windows.lock();
        let Windows { global, routes } = &mut *windows;
        if self.config.global.is_some() {
            remove_latest(global, at);
        }
        if let Some(window) = routes.get_mut(route) {
            remove_latest(window, at);
        }
    }

    pub fn snapshot(&self, now: DateTime<Utc>) -> Vec<WindowSnapshot> {
        let mut windows = self.windows.lock();
        let mut out = Vec::new();

        if let Some(limit) = self.config.global.as_ref() {
            trim(&mut windows.global, limit, now);
            out.push(WindowSnapshot {
                scope: "global".into(),
                used: windows.global.len(),
                max_events: limit.max_events,
                window_secs: limit.window_secs,
            });
        }

        let mut routes: Vec<_> = windows.routes.keys().cloned().collect();
        routes.sort();
        for route in routes {
            let Some(limit) = self.route_limit(&route) else {
                continue;
            };
            if let Some(window) = windows.routes.get_mut(&route) {
                trim(window, &limit, now);
                out.push(WindowSnapshot {
                    scope: route,
                    used: window.len(),
                    max_events: limit.max_events,
                    window_secs: limit.window_secs,
                });
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(global: Option<WindowLimit>, per_route: Option<WindowLimit>) -> SlidingWindowRateLimiter {
        SlidingWindowRateLimiter::new(RateLimitConfig {
            global,
            per_route,
            route_overrides: HashMap::new(),
        })
    }

    #[test]
    fn sixth_call_in_window_is_rejected_until_window_passes() {
        let rl = limiter(None, Some(WindowLimit::new(5, 60)));
        let start = Utc::now();
        for i in 0..5 {
            assert!(rl.allow("x:a", start + Duration::seconds(i)).allowed);
        }

        let denied = rl.allow("x:a", start + Duration::seconds(10));
        assert!(!denied.allowed);
        assert!(denied.retry_after_secs > 0.0);
        assert!((denied.retry_after_secs - 50.0).abs() < 1e-6);

        assert!(rl.allow("x:a", start + Duration::seconds(61)).allowed);
    }

    #[test]
    fn rejection_does_not_consume_a_slot() {
        let rl = limiter(None, Some(WindowLimit::new(1, 10)));
        let now = Utc::now();
        assert!(rl.allow("r", now).allowed);
        for _ in 0..10 {
            assert!(!rl.allow("r", now).allowed);
        }
        assert!(rl.allow("r", now + Duration::seconds(11)).allowed);
    }

    #[test]
    fn global_scope_spans_routes_and_routes_are_isolated() {
        let rl = limiter(Some(WindowLimit::new(3, 60)), Some(WindowLimit::new(2, 60)));
        let now = Utc::now();
        assert!(rl.allow("a", now).allowed);
        assert!(rl.allow("a", now).allowed);
        assert!(!rl.allow("a", now).allowed);
        assert!(rl.allow("b", now).allowed);
        // Global window is now full even though route b has room.
        assert!(!rl.allow("b", now).allowed);

        let snap = rl.snapshot(now);
        assert_eq!(snap[0].scope, "global");
        assert_eq!(snap[0].used, 3);
    }

    #[test]
    fn route_override_replaces_default_limit() {
        let mut config = RateLimitConfig {
            global: None,
            per_route: Some(WindowLimit::new(1, 60)),
            route_overrides: HashMap::new(),
        };
        config
            .route_overrides
            .insert("vip".into(), WindowLimit::new(3, 60));
        let rl = SlidingWindowRateLimiter::new(config);
        let now = Utc::now();
        assert!(rl.allow("vip", now).allowed);
        assert!(rl.allow("vip", now).allowed);
        assert!(rl.allow("other", now).allowed);
        assert!(!rl.allow("other", now).allowed);
    }

    #[test]
    fn refunded_slot_is_available_again() {
        let rl = limiter(Some(WindowLimit::new(5, 60)), Some(WindowLimit::new(1, 60)));
        let now = Utc::now();
        assert!(rl.allow("r", now).allowed);
        assert!(!rl.allow("r", now).allowed);

        rl.refund("r", now);
        assert!(rl.allow("r", now).allowed);
        let global = rl.snapshot(now).into_iter().find(|w| w.scope == "global").unwrap();
        assert_eq!(global.used, 1);
    }
}
