//! Retry policy shared by the realtime channels.

use std::time::Duration;

/// Default cap on consecutive failures before giving up.
pub const DEFAULT_MAX_CONSECUTIVE_FAILURES: u32 = 3;

/// Default delay before a reconnect attempt.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// Fixed-delay retry policy with a consecutive-failure cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Failures in a row after which no retry is scheduled.
    pub max_consecutive_failures: u32,
    /// Delay before each retry.
    pub delay: Duration,
}

impl RetryPolicy {
    /// Create a policy.
    #[must_use]
    pub const fn new(max_consecutive_failures: u32, delay: Duration) -> Self {
        Self {
            max_consecutive_failures,
            delay,
        }
    }

    /// Create a tracker bound to this policy.
    #[must_use]
    pub fn tracker(&self) -> FailureTracker {
        FailureTracker::new(*self)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CONSECUTIVE_FAILURES, DEFAULT_RECONNECT_DELAY)
    }
}

/// Counts consecutive failures against a [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct FailureTracker {
    policy: RetryPolicy,
    consecutive: u32,
}

impl FailureTracker {
    /// Create a tracker with no failures recorded.
    #[must_use]
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            consecutive: 0,
        }
    }

    /// Record a failure.
    ///
    /// Returns the delay before the next attempt, or `None` once the cap is
    /// reached.
    pub fn record_failure(&mut self) -> Option<Duration> {
        self.consecutive = self.consecutive.saturating_add(1);
        if self.exhausted() {
            None
        } else {
            Some(self.policy.delay)
        }
    }

    /// Forget all recorded failures.
    pub fn reset(&mut self) {
        self.consecutive = 0;
    }

    /// Whether the cap has been reached.
    #[must_use]
    pub fn exhausted(&self) -> bool {
        self.consecutive >= self.policy.max_consecutive_failures
    }

    /// Get the number of consecutive failures.
    #[must_use]
    pub fn count(&self) -> u32 {
        self.consecutive
    }

    /// Get the policy.
    #[must_use]
    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }
}
