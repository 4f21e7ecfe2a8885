use crate::error::{Result, SessionError};
use crate::types::SessionConfig;
use rand::Rng;
use std::time::Duration;

/// Exponential reconnect backoff with full jitter
///
/// The backoff ceiling for attempt `n` is `min(max, min * 2^n)`; the realized
/// wait is drawn uniformly from `[0, ceiling]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    min_backoff: Duration,
    max_backoff: Duration,
}

impl ReconnectPolicy {
    /// # Errors
    ///
    /// Returns `SessionError::InvalidConfig` if `min_backoff > max_backoff`
    pub fn new(min_backoff: Duration, max_backoff: Duration) -> Result<Self> {
        if min_backoff > max_backoff {
            return Err(SessionError::InvalidConfig(format!(
                "reconnect min backoff {min_backoff:?} exceeds max backoff {max_backoff:?}"
            )));
        }
        Ok(Self {
            min_backoff,
            max_backoff,
        })
    }

    /// # Errors
    ///
    /// Returns `SessionError::InvalidConfig` if the backoff bounds are inverted
    pub fn from_config(config: &SessionConfig) -> Result<Self> {
        Self::new(config.reconnect_min_timeout, config.reconnect_max_timeout)
    }

    #[must_use]
    pub fn min_backoff(&self) -> Duration {
        self.min_backoff
    }

    #[must_use]
    pub fn max_backoff(&self) -> Duration {
        self.max_backoff
    }

    /// Backoff ceiling for the given attempt number
    #[must_use]
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.min_backoff
            .checked_mul(factor)
            .map_or(self.max_backoff, |delay| delay.min(self.max_backoff))
    }

    /// Realized wait for the given attempt: uniform in `[0, next_delay(attempt)]`
    #[must_use]
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let ceiling = self.next_delay(attempt);
        if ceiling.is_zero() {
            return ceiling;
        }
        let nanos = u64::try_from(ceiling.as_nanos()).unwrap_or(u64::MAX);
        Duration::from_nanos(rand::thread_rng().gen_range(0..=nanos))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_rejects_inverted_bounds() {
        let result = ReconnectPolicy::new(Duration::from_secs(10), Duration::from_secs(5));
        assert!(matches!(result, Err(SessionError::InvalidConfig(_))));
    }

    #[test]
    fn test_exponential_growth_capped() {
        let policy = ReconnectPolicy::new(Duration::from_secs(5), Duration::from_secs(60)).unwrap();
        assert_eq!(policy.next_delay(0), Duration::from_secs(5));
        assert_eq!(policy.next_delay(1), Duration::from_secs(10));
        assert_eq!(policy.next_delay(2), Duration::from_secs(20));
        assert_eq!(policy.next_delay(3), Duration::from_secs(40));
        assert_eq!(policy.next_delay(4), Duration::from_secs(60));
        assert_eq!(policy.next_delay(40), Duration::from_secs(60));
        assert_eq!(policy.next_delay(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn test_equal_bounds() {
        let policy = ReconnectPolicy::new(Duration::from_secs(3), Duration::from_secs(3)).unwrap();
        assert_eq!(policy.next_delay(0), Duration::from_secs(3));
        assert_eq!(policy.next_delay(7), Duration::from_secs(3));
    }

    #[test]
    fn test_zero_backoff() {
        let policy = ReconnectPolicy::new(Duration::ZERO, Duration::ZERO).unwrap();
        assert_eq!(policy.jittered_delay(5), Duration::ZERO);
    }

    #[test]
    fn test_from_config_defaults() {
        let config = SessionConfig::new("c", "localhost", 1883);
        let policy = ReconnectPolicy::from_config(&config).unwrap();
        assert_eq!(policy.min_backoff(), Duration::from_secs(5));
        assert_eq!(policy.max_backoff(), Duration::from_secs(60));
    }

    proptest! {
        #[test]
        fn prop_delay_monotonic_and_bounded(
            min_ms in 0u64..10_000,
            extra_ms in 0u64..600_000,
            attempt in 0u32..64,
        ) {
            let policy = ReconnectPolicy::new(
                Duration::from_millis(min_ms),
                Duration::from_millis(min_ms + extra_ms),
            ).unwrap();

            let current = policy.next_delay(attempt);
            let next = policy.next_delay(attempt + 1);
            prop_assert!(next >= current);
            prop_assert!(current <= policy.max_backoff());
            prop_assert!(policy.next_delay(0) == policy.min_backoff());
        }

        #[test]
        fn prop_jitter_within_ceiling(
            min_ms in 1u64..5_000,
            attempt in 0u32..16,
        ) {
            let policy = ReconnectPolicy::new(
                Duration::from_millis(min_ms),
                Duration::from_secs(60),
            ).unwrap();
            let delay = policy.jittered_delay(attempt);
            prop_assert!(delay <= policy.next_delay(attempt));
        }
    }
}
