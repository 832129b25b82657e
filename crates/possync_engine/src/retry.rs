//! Retry and backoff supervision.

use crate::error::SyncError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Delay before the first retry; doubled for every further one.
    #[serde(rename = "base_delay_ms", with = "crate::config::millis")]
    pub base_delay: Duration,
    /// Consecutive transient failures tolerated before giving up.
    pub max_attempts: u32,
    /// Upper bound for a single delay.
    #[serde(rename = "max_delay_ms", with = "crate::config::millis")]
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Creates a policy with the default delays.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            base_delay: Duration::from_millis(1000),
            max_attempts,
            max_delay: Duration::from_secs(60),
        }
    }

    /// Creates a policy that gives up on the first failure.
    pub fn no_retry() -> Self {
        Self {
            base_delay: Duration::ZERO,
            max_attempts: 1,
            max_delay: Duration::ZERO,
        }
    }

    /// Sets the base delay.
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the attempt budget.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Calculates the delay after the failure numbered `attempt` (0-indexed):
    /// `base_delay * 2^attempt`, capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Returns the delay after each of the first `max_attempts` failures.
    pub fn schedule(&self) -> Vec<Duration> {
        (0..self.max_attempts)
            .map(|attempt| self.delay_for_attempt(attempt))
            .collect()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3)
    }
}

/// What to do after a failed cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Wait, then run the cycle again.
    RetryAfter(Duration),
    /// The retry budget is spent.
    GiveUp {
        /// Consecutive failures observed.
        attempts: u32,
    },
    /// The error is not retryable.
    Fatal,
}

/// Tracks consecutive failures of one session.
#[derive(Debug, Clone)]
pub struct RetrySupervisor {
    policy: RetryPolicy,
    failures: u32,
}

impl RetrySupervisor {
    /// Creates a supervisor with no failures recorded.
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            failures: 0,
        }
    }

    /// Classifies `error` and records it.
    pub fn on_error(&mut self, error: &SyncError) -> RetryDecision {
        if !error.is_retryable() {
            return RetryDecision::Fatal;
        }
        self.failures += 1;
        if self.failures >= self.policy.max_attempts {
            return RetryDecision::GiveUp {
                attempts: self.failures,
            };
        }
        RetryDecision::RetryAfter(self.policy.delay_for_attempt(self.failures - 1))
    }

    /// Resets the failure counter.
    pub fn on_success(&mut self) {
        self.failures = 0;
    }

    /// Consecutive failures so far.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Returns the policy.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transient() -> SyncError {
        SyncError::Transient("offline".into())
    }

    #[test]
    fn default_schedule_doubles() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.schedule(),
            vec![
                Duration::from_millis(1000),
                Duration::from_millis(2000),
                Duration::from_millis(4000),
            ]
        );
    }

    #[test]
    fn delay_respects_max() {
        let policy = RetryPolicy::new(40).with_max_delay(Duration::from_secs(5));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(5));
        assert_eq!(policy.delay_for_attempt(39), Duration::from_secs(5));
    }

    #[test]
    fn gives_up_after_max_attempts() {
        let mut supervisor = RetrySupervisor::new(RetryPolicy::default());
        assert_eq!(
            supervisor.on_error(&transient()),
            RetryDecision::RetryAfter(Duration::from_millis(1000))
        );
        assert_eq!(
            supervisor.on_error(&transient()),
            RetryDecision::RetryAfter(Duration::from_millis(2000))
        );
        assert_eq!(
            supervisor.on_error(&transient()),
            RetryDecision::GiveUp { attempts: 3 }
        );
    }

    #[test]
    fn success_resets_counter() {
        let mut supervisor = RetrySupervisor::new(RetryPolicy::default());
        supervisor.on_error(&transient());
        supervisor.on_error(&transient());
        supervisor.on_success();
        assert_eq!(supervisor.failures(), 0);
        assert_eq!(
            supervisor.on_error(&transient()),
            RetryDecision::RetryAfter(Duration::from_millis(1000))
        );
    }

    #[test]
    fn authorization_is_fatal() {
        let mut supervisor = RetrySupervisor::new(RetryPolicy::default());
        let decision = supervisor.on_error(&SyncError::Unauthorized("denied".into()));
        assert_eq!(decision, RetryDecision::Fatal);
        assert_eq!(supervisor.failures(), 0);
    }

    #[test]
    fn no_retry_gives_up_immediately() {
        let mut supervisor = RetrySupervisor::new(RetryPolicy::no_retry());
        assert_eq!(
            supervisor.on_error(&transient()),
            RetryDecision::GiveUp { attempts: 1 }
        );
    }
}
