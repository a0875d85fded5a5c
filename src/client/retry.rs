//! Exponential backoff policy, kept apart from the transport call.

use std::time::Duration;

/// Bounded exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
}

impl RetryPolicy {
    /// Creates a policy allowing `max_attempts` total attempts. The first
    /// attempt is always made; `SyncControls::validate` rejects zero.
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay: max_delay.max(base_delay),
        }
    }

    /// A policy that never retries.
    pub fn no_retry() -> Self {
        Self::new(1, Duration::ZERO, Duration::ZERO)
    }

    /// Total attempts including the first.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay to wait after the `attempt`-th failed attempt (1-based), or `None`
    /// once the attempt budget is spent.
    pub fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt >= self.max_attempts {
            return None;
        }
        let exponent = (attempt - 1).min(16);
        let delay = self.base_delay.saturating_mul(1u32 << exponent);
        Some(delay.min(self.max_delay))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(4, Duration::from_millis(500), Duration::from_secs(8))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_double_until_capped() {
        let policy = RetryPolicy::new(6, Duration::from_millis(500), Duration::from_secs(3));
        let delays: Vec<_> = (1..6).map(|n| policy.next_delay(n).unwrap()).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(500),
                Duration::from_millis(1000),
                Duration::from_millis(2000),
                Duration::from_secs(3),
                Duration::from_secs(3),
            ]
        );
        assert_eq!(policy.next_delay(6), None);
    }

    #[test]
    fn single_attempt_policy_never_waits() {
        let policy = RetryPolicy::no_retry();
        assert_eq!(policy.max_attempts(), 1);
        assert_eq!(policy.next_delay(1), None);
    }

    #[test]
    fn zero_attempts_are_kept_for_validation() {
        let policy = RetryPolicy::new(0, Duration::from_millis(10), Duration::from_millis(10));
        assert_eq!(policy.max_attempts(), 0);
        assert_eq!(policy.next_delay(1), None);
    }
}
