//! Backoff schedule for stage-local retries of transient errors.

use std::time::Duration;

use rand::Rng;

use docket_core::{defaults, Error};

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: defaults::STAGE_MAX_RETRIES,
            initial_backoff: Duration::from_millis(defaults::RETRY_INITIAL_BACKOFF_MS),
            max_backoff: Duration::from_millis(defaults::RETRY_MAX_BACKOFF_MS),
        }
    }
}

impl RetryPolicy {
    /// Never retry.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn with_max_retries(mut self, n: u32) -> Self {
        self.max_retries = n;
        self
    }

    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max.max(initial);
        self
    }

    /// Whether `error` after `attempt` (1-based) earns another try.
    pub fn should_retry(&self, error: &Error, attempt: u32) -> bool {
        error.is_transient() && attempt <= self.max_retries
    }

    /// Delay before retry number `retry` (1-based).
    ///
    /// Doubles from the initial backoff up to the cap, plus up to 25% jitter
    /// (never past the cap).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(20);
        let base = self
            .initial_backoff
            .saturating_mul(1u32 << exp)
            .min(self.max_backoff);
        let jitter_ms = (base.as_millis() as u64) / 4;
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_ms)
        };
        (base + Duration::from_millis(jitter)).min(self.max_backoff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_grows_and_caps() {
        let policy = RetryPolicy::default()
            .with_backoff(Duration::from_millis(100), Duration::from_millis(1000));

        let first = policy.delay_for(1);
        assert!(first >= Duration::from_millis(100) && first <= Duration::from_millis(125));

        let third = policy.delay_for(3);
        assert!(third >= Duration::from_millis(400) && third <= Duration::from_millis(500));

        for retry in 5..40 {
            assert_eq!(policy.delay_for(retry), Duration::from_millis(1000));
        }
    }

    #[test]
    fn test_only_transient_errors_retry() {
        let policy = RetryPolicy::default().with_max_retries(2);
        let transient = Error::Transient("reset".into());
        let invalid = Error::Validation("empty text".into());

        assert!(policy.should_retry(&transient, 1));
        assert!(policy.should_retry(&transient, 2));
        assert!(!policy.should_retry(&transient, 3));
        assert!(!policy.should_retry(&invalid, 1));
        assert!(!RetryPolicy::none().should_retry(&transient, 1));
    }
}
