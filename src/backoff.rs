//! Backoff strategies for queue-item retries.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How the delay between retry attempts grows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    /// Same delay every attempt.
    Fixed,
    /// Delay grows linearly with the attempt number.
    Linear,
    /// Delay doubles each attempt.
    #[default]
    Exponential,
}

/// Delay computation between `initial` and `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBackoff {
    strategy: BackoffStrategy,
    initial: Duration,
    max: Duration,
}

impl RetryBackoff {
    pub fn new(strategy: BackoffStrategy, initial: Duration, max: Duration) -> Self {
        Self { strategy, initial, max: max.max(initial) }
    }

    pub fn fixed(delay: Duration) -> Self {
        Self::new(BackoffStrategy::Fixed, delay, delay)
    }

    pub fn linear(initial: Duration, max: Duration) -> Self {
        Self::new(BackoffStrategy::Linear, initial, max)
    }

    pub fn exponential(initial: Duration, max: Duration) -> Self {
        Self::new(BackoffStrategy::Exponential, initial, max)
    }

    /// Delay before the given attempt (1-indexed), clamped to `max`.
    pub fn delay(&self, attempt: usize) -> Duration {
        let attempt = attempt.max(1);
        let raw = match self.strategy {
            BackoffStrategy::Fixed => self.initial,
            BackoffStrategy::Linear => self
                .initial
                .checked_mul(attempt as u32)
                .unwrap_or(Duration::from_secs(u64::MAX)),
            BackoffStrategy::Exponential => {
                let exponent = (attempt - 1) as u32;
                let multiplier = 2u32.saturating_pow(exponent);
                self.initial
                    .checked_mul(multiplier)
                    .unwrap_or(Duration::from_secs(u64::MAX))
            }
        };
        raw.min(self.max)
    }
}

impl Default for RetryBackoff {
    fn default() -> Self {
        Self::exponential(Duration::from_secs(1), Duration::from_secs(10))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_backoff_returns_same_delay() {
        let backoff = RetryBackoff::fixed(Duration::from_secs(1));
        assert_eq!(backoff.delay(1), Duration::from_secs(1));
        assert_eq!(backoff.delay(5), Duration::from_secs(1));
    }

    #[test]
    fn linear_backoff_increases_linearly_until_max() {
        let backoff = RetryBackoff::linear(Duration::from_millis(100), Duration::from_millis(250));
        assert_eq!(backoff.delay(1), Duration::from_millis(100));
        assert_eq!(backoff.delay(2), Duration::from_millis(200));
        assert_eq!(backoff.delay(3), Duration::from_millis(250));
        assert_eq!(backoff.delay(10), Duration::from_millis(250));
    }

    #[test]
    fn exponential_backoff_doubles_until_max() {
        let backoff = RetryBackoff::exponential(Duration::from_secs(1), Duration::from_secs(10));
        assert_eq!(backoff.delay(1), Duration::from_secs(1));
        assert_eq!(backoff.delay(2), Duration::from_secs(2));
        assert_eq!(backoff.delay(3), Duration::from_secs(4));
        assert_eq!(backoff.delay(4), Duration::from_secs(8));
        assert_eq!(backoff.delay(5), Duration::from_secs(10));
        assert_eq!(backoff.delay(64), Duration::from_secs(10));
    }

    #[test]
    fn attempt_zero_behaves_like_attempt_one() {
        let backoff = RetryBackoff::exponential(Duration::from_secs(1), Duration::from_secs(10));
        assert_eq!(backoff.delay(0), backoff.delay(1));
    }

    #[test]
    fn max_below_initial_is_lifted_to_initial() {
        let backoff =
            RetryBackoff::exponential(Duration::from_secs(5), Duration::from_secs(1));
        assert_eq!(backoff.delay(1), Duration::from_secs(5));
        assert_eq!(backoff.delay(4), Duration::from_secs(5));
    }

    #[test]
    fn strategy_names_round_trip_through_serde() {
        for (strategy, name) in [
            (BackoffStrategy::Fixed, "\"fixed\""),
            (BackoffStrategy::Linear, "\"linear\""),
            (BackoffStrategy::Exponential, "\"exponential\""),
        ] {
            assert_eq!(serde_json::to_string(&strategy).unwrap(), name);
            let back: BackoffStrategy = serde_json::from_str(name).unwrap();
            assert_eq!(back, strategy);
        }
    }
}
