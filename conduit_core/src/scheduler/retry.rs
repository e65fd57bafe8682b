use crate::{Error, Result};
use std::time::Duration;

/// Exponential backoff with a capped number of automatic retries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Automatic retries after the first failure; 0 disables retrying.
    pub max_attempts: u32,
    pub base: Duration,
    pub max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base: Duration::from_secs(30),
            max: Duration::from_secs(15 * 60),
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_attempts: 0,
            ..Self::default()
        }
    }

    #[tracing::instrument(level = "debug")]
    pub fn validate(&self) -> Result<()> {
        if self.base.is_zero() {
            return Err(Error::InvalidInput("retry.base must be > 0".to_string()));
        }
        if self.max < self.base {
            return Err(Error::InvalidInput(
                "retry.max must be >= retry.base".to_string(),
            ));
        }
        Ok(())
    }

    /// Whether a job that has already been retried `retry_count` times may be
    /// retried again.
    pub fn allows(&self, retry_count: u32) -> bool {
        retry_count < self.max_attempts
    }

    /// Delay before retry number `retry_count` (0-based): base * 2^n, capped.
    pub fn backoff(&self, retry_count: u32) -> Duration {
        let shift = retry_count.min(63);
        let exp = 1u128 << shift;
        let ms = self.base.as_millis().saturating_mul(exp);
        Duration::from_millis(ms.min(self.max.as_millis()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base: Duration::from_millis(100),
            max: Duration::from_millis(1_000),
        }
    }

    #[test]
    fn backoff_doubles_then_caps() {
        let p = policy();
        assert_eq!(p.backoff(0), Duration::from_millis(100));
        assert_eq!(p.backoff(1), Duration::from_millis(200));
        assert_eq!(p.backoff(3), Duration::from_millis(800));
        assert_eq!(p.backoff(4), Duration::from_millis(1_000));
        assert_eq!(p.backoff(200), Duration::from_millis(1_000));
    }

    #[test]
    fn attempts_are_capped() {
        let p = policy();
        assert!(p.allows(0));
        assert!(p.allows(2));
        assert!(!p.allows(3));
        assert!(!RetryPolicy::none().allows(0));
    }

    #[test]
    fn max_below_base_is_invalid() {
        let p = RetryPolicy {
            max: Duration::from_millis(10),
            ..policy()
        };
        assert!(p.validate().is_err());
    }
}
