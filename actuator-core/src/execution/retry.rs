use chrono::{DateTime, Duration, Utc};
use rand::Rng;

use crate::clock;

use super::config::RetryConfig;

/// Exponential backoff with symmetric jitter for environment failures.
#[derive(Clone, Copy, Debug)]
pub struct RetryScheduler {
    config: RetryConfig,
}

impl RetryScheduler {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub fn should_retry(&self, attempt_count: u32, max_attempts: u32) -> bool {
        attempt_count < max_attempts
    }

    /// Capped exponential delay before jitter, in milliseconds.
    pub fn anchor_delay_ms(&self, attempt_count: u32) -> f64 {
        let exp = attempt_count.saturating_sub(1).min(i32::MAX as u32) as i32;
        let scaled = (self.config.base_delay_ms as f64) * self.config.factor.max(1.0).powi(exp);
        scaled.min(self.config.max_delay_ms as f64).max(0.0)
    }

    /// Delay for a given uniform sample `unit` in `[0, 1]`. `0.5` yields the
    /// un-jittered anchor.
    pub fn delay_for_unit(&self, attempt_count: u32, unit: f64) -> Duration {
        let anchor = self.anchor_delay_ms(attempt_count);
        let span = anchor * self.config.jitter_ratio.clamp(0.0, 1.0);
        let jittered = anchor - span + (2.0 * span * unit.clamp(0.0, 1.0));
        let floored = jittered.max(self.config.min_delay_ms as f64);
        Duration::milliseconds(floored.round() as i64)
    }

    pub fn next_delay(&self, attempt_count: u32) -> Duration {
        let unit = rand::rng().random::<f64>();
        self.delay_for_unit(attempt_count, unit)
    }

    pub fn next_retry_at(&self, attempt_count: u32, now: DateTime<Utc>) -> DateTime<Utc> {
        clock::saturating_add(now, self.next_delay(attempt_count))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheduler() -> RetryScheduler {
        RetryScheduler::new(RetryConfig {
            max_attempts: 5,
            base_delay_ms: 1_000,
            factor: 2.0,
            max_delay_ms: 10_000,
            jitter_ratio: 0.2,
            min_delay_ms: 100,
        })
    }

    #[test]
    fn should_retry_until_budget_is_spent() {
        let s = scheduler();
        assert!(s.should_retry(1, 2));
        assert!(!s.should_retry(2, 2));
        assert!(!s.should_retry(3, 2));
    }

    #[test]
    fn anchor_grows_exponentially_then_caps() {
        let s = scheduler();
        assert_eq!(s.anchor_delay_ms(1), 1_000.0);
        assert_eq!(s.anchor_delay_ms(2), 2_000.0);
        assert_eq!(s.anchor_delay_ms(4), 8_000.0);
        assert_eq!(s.anchor_delay_ms(5), 10_000.0);
        assert_eq!(s.anchor_delay_ms(60), 10_000.0);
    }

    #[test]
    fn jitter_stays_within_ratio_of_capped_delay() {
        let s = scheduler();
        assert_eq!(s.delay_for_unit(3, 0.0), Duration::milliseconds(3_200));
        assert_eq!(s.delay_for_unit(3, 0.5), Duration::milliseconds(4_000));
        assert_eq!(s.delay_for_unit(3, 1.0), Duration::milliseconds(4_800));
        for _ in 0..200 {
            let d = s.next_delay(3).num_milliseconds();
            assert!((3_200..=4_800).contains(&d), "delay {d} out of range");
        }
    }

    #[test]
    fn next_retry_at_is_non_decreasing_below_the_cap() {
        let s = scheduler();
        let now = Utc::now();
        let mut previous = now;
        for attempt in 1..=4 {
            // Worst case for monotonicity: lowest draw now, highest draw before.
            let low = now + s.delay_for_unit(attempt, 0.0);
            assert!(low >= previous, "attempt {attempt} regressed");
            previous = now + s.delay_for_unit(attempt, 1.0);
        }
    }

    #[test]
    fn delay_never_drops_below_floor() {
        let s = RetryScheduler::new(RetryConfig {
            base_delay_ms: 0,
            jitter_ratio: 1.0,
            ..RetryConfig::default()
        });
        let now = Utc::now();
        for attempt in 0..5 {
            assert!(s.next_retry_at(attempt, now) >= now + Duration::milliseconds(100));
        }
    }
}
