//! Capped exponential backoff for transaction retries.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry budget for one transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryPolicy {
    /// Retries after the first attempt. 0 disables retrying.
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 1_000,
            max_backoff_ms: 10_000,
        }
    }
}

impl RetryPolicy {
    pub fn no_retries() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (1-based):
    /// `min(initial * 2^(attempt-1), max)`.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(63);
        let multiplier = 1u64.checked_shl(shift).unwrap_or(u64::MAX);
        let delay_ms = self
            .initial_backoff_ms
            .saturating_mul(multiplier)
            .min(self.max_backoff_ms);
        Duration::from_millis(delay_ms)
    }

    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff::new(*self)
    }

    /// Sum of every delay the policy can schedule.
    pub fn total_backoff(&self) -> Duration {
        (1..=self.max_retries).map(|attempt| self.backoff_for(attempt)).sum()
    }
}

/// Stateful walk through a [`RetryPolicy`]'s delays.
#[derive(Clone, Debug)]
pub struct ExponentialBackoff {
    policy: RetryPolicy,
    attempt: u32,
}

impl ExponentialBackoff {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Get the next delay in the sequence.
    ///
    /// Returns `None` once `max_retries` delays have been handed out.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.is_exhausted() {
            return None;
        }
        self.attempt = self.attempt.saturating_add(1);
        Some(self.policy.backoff_for(self.attempt))
    }

    /// Number of delays generated so far, i.e. retries consumed.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempt >= self.policy.max_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_double_until_capped() {
        let mut backoff = RetryPolicy {
            max_retries: 5,
            initial_backoff_ms: 1_000,
            max_backoff_ms: 5_000,
        }
        .backoff();

        let delays: Vec<u64> = std::iter::from_fn(|| backoff.next_delay())
            .map(|delay| delay.as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![1_000, 2_000, 4_000, 5_000, 5_000]);
        assert!(backoff.is_exhausted());
        assert_eq!(backoff.attempt(), 5);
    }

    #[test]
    fn default_schedule_sums_to_seven_seconds() {
        assert_eq!(RetryPolicy::default().total_backoff(), Duration::from_secs(7));
    }

    #[test]
    fn zero_retries_never_sleeps() {
        let mut backoff = RetryPolicy::no_retries().backoff();
        assert!(backoff.next_delay().is_none());
    }

    #[test]
    fn huge_attempts_saturate() {
        let policy = RetryPolicy {
            max_retries: u32::MAX,
            initial_backoff_ms: u64::MAX / 2,
            max_backoff_ms: u64::MAX,
        };
        assert_eq!(policy.backoff_for(200), Duration::from_millis(u64::MAX));
    }
}
