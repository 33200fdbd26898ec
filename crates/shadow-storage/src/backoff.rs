use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    /// Policy used for local storage writes: quicker first retry, more attempts.
    pub fn storage_default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(2),
        }
    }

    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

/// Backoff bookkeeping for a single logical operation. Never persisted.
#[derive(Debug, Clone)]
pub struct RetryLedger {
    policy: BackoffPolicy,
    failures: usize,
}

impl RetryLedger {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            failures: 0,
        }
    }

    /// Attempts made so far that ended in failure.
    pub fn failures(&self) -> usize {
        self.failures
    }

    /// Records a failed attempt; returns the delay before the next one, or
    /// `None` once the retry ceiling is reached.
    pub fn record_failure(&mut self) -> Option<Duration> {
        self.failures += 1;
        if self.failures > self.policy.max_retries {
            None
        } else {
            Some(self.policy.delay_for_attempt(self.failures - 1))
        }
    }
}
