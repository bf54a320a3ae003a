//! Retry backoff policy for temporarily failed jobs.
//!
//! Delays grow exponentially with the attempt number, are capped, and get
//! a symmetric jitter so synchronized failures don't re-queue in lockstep.

use std::time::Duration;

use rand::Rng;

use scanforge_core::config::RetrySettings;

/// Exponential backoff with cap and jitter:
/// `min(base * 2^(attempt-1), cap) ± jitter_ratio`.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    base: Duration,
    cap: Duration,
    jitter_ratio: f64,
}

impl BackoffPolicy {
    /// Creates a policy from explicit parts.
    #[must_use]
    pub const fn new(base: Duration, cap: Duration, jitter_ratio: f64) -> Self {
        Self {
            base,
            cap,
            jitter_ratio,
        }
    }

    /// Creates a policy from the retry settings.
    #[must_use]
    pub const fn from_settings(settings: &RetrySettings) -> Self {
        Self {
            base: Duration::from_millis(settings.retry_backoff_base_ms),
            cap: Duration::from_millis(settings.retry_backoff_cap_ms),
            jitter_ratio: settings.retry_jitter_ratio,
        }
    }

    /// The capped exponential delay for an attempt, before jitter.
    ///
    /// Attempt 1 waits `base`; each further attempt doubles, up to `cap`.
    #[must_use]
    pub fn raw_delay(&self, attempt: u32) -> Duration {
        let doublings = attempt.saturating_sub(1).min(32);
        let factor = 1_u64 << doublings;
        let millis = u64::try_from(self.base.as_millis())
            .unwrap_or(u64::MAX)
            .saturating_mul(factor);
        Duration::from_millis(millis).min(self.cap)
    }

    /// The delay for an attempt with jitter applied.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let raw = self.raw_delay(attempt);
        if self.jitter_ratio <= 0.0 {
            return raw;
        }
        let spread = self.jitter_ratio.min(1.0);
        let factor = rand::rng().random_range(1.0 - spread..=1.0 + spread);
        raw.mul_f64(factor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> BackoffPolicy {
        BackoffPolicy::new(
            Duration::from_millis(1000),
            Duration::from_millis(8000),
            0.0,
        )
    }

    #[test]
    fn delay_doubles_per_attempt() {
        let policy = policy();
        assert_eq!(policy.raw_delay(1), Duration::from_millis(1000));
        assert_eq!(policy.raw_delay(2), Duration::from_millis(2000));
        assert_eq!(policy.raw_delay(3), Duration::from_millis(4000));
    }

    #[test]
    fn delay_is_capped() {
        let policy = policy();
        assert_eq!(policy.raw_delay(5), Duration::from_millis(8000));
        assert_eq!(policy.raw_delay(40), Duration::from_millis(8000));
    }

    #[test]
    fn attempt_zero_behaves_like_first() {
        let policy = policy();
        assert_eq!(policy.raw_delay(0), Duration::from_millis(1000));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = BackoffPolicy::new(
            Duration::from_millis(1000),
            Duration::from_millis(60_000),
            0.25,
        );
        for _ in 0..100 {
            let jittered = policy.delay(2);
            assert!(jittered >= Duration::from_millis(1500));
            assert!(jittered <= Duration::from_millis(2500));
        }
    }

    #[test]
    fn from_settings_uses_configured_values() {
        let settings = RetrySettings {
            max_retries: 3,
            retry_backoff_base_ms: 100,
            retry_backoff_cap_ms: 400,
            retry_jitter_ratio: 0.0,
        };
        let policy = BackoffPolicy::from_settings(&settings);
        assert_eq!(policy.raw_delay(1), Duration::from_millis(100));
        assert_eq!(policy.raw_delay(4), Duration::from_millis(400));
    }
}
