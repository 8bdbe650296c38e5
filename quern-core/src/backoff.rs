//! Retry backoff policy.

use std::time::Duration;

use rand::Rng;

/// Full-jitter exponential backoff.
///
/// For the 1-based attempt `n` the delay is drawn uniformly from
/// `[0, min(max_interval, base_delay * 2^n)]`; drawing zero is legal.
#[derive(Clone, Copy, Debug)]
pub struct RetryBackoff {
    base_delay: Duration,
    max_interval: Duration,
}

impl Default for RetryBackoff {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(250),
            max_interval: Duration::from_secs(60),
        }
    }
}

impl RetryBackoff {
    pub fn new(base_delay: Duration, max_interval: Duration) -> Self {
        Self {
            base_delay,
            max_interval,
        }
    }

    /// Upper bound of the jitter window for the given attempt.
    pub fn cap(&self, attempt: u32) -> Duration {
        // 2^1024 saturates to infinity and the min() below caps it.
        let exponential = self.base_delay.as_secs_f64() * 2f64.powi(attempt.min(1024) as i32);
        Duration::from_secs_f64(exponential.min(self.max_interval.as_secs_f64()))
    }

    /// Delay to apply before the given 1-based retry attempt.
    pub fn delay(&self, attempt: u32) -> Duration {
        let cap = self.cap(attempt).as_secs_f64();
        Duration::from_secs_f64(rand::rng().random_range(0.0..=cap))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_policy() {
        let backoff = RetryBackoff::default();
        assert_eq!(backoff.cap(1), Duration::from_millis(500));
        assert_eq!(backoff.cap(2), Duration::from_secs(1));
        assert_eq!(backoff.cap(8), Duration::from_secs(60));
    }

    #[test]
    fn cap_saturates_at_max_interval() {
        let backoff = RetryBackoff::default();
        assert_eq!(backoff.cap(500), Duration::from_secs(60));
        assert_eq!(backoff.cap(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn delay_stays_within_the_window() {
        let backoff = RetryBackoff::default();
        for attempt in 1..=10 {
            let cap = backoff.cap(attempt);
            for _ in 0..200 {
                let delay = backoff.delay(attempt);
                assert!(delay <= cap, "attempt {attempt}: {delay:?} > {cap:?}");
            }
        }
    }

    #[test]
    fn cap_is_monotone_in_attempts() {
        let backoff = RetryBackoff::new(Duration::from_millis(100), Duration::from_secs(30));
        let mut previous = Duration::ZERO;
        for attempt in 1..=20 {
            let cap = backoff.cap(attempt);
            assert!(cap >= previous);
            previous = cap;
        }
    }
}
