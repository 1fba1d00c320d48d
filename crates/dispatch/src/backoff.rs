//! Jittered exponential backoff.
//!
//! Shared by the producer's enqueue retries and the workers' idle polling.
//! Delays double per attempt up to a hard cap; jitter spreads synchronized
//! callers out so a worker pool does not hammer the store in lockstep.

use std::time::Duration;

use rand::Rng;

/// Backoff schedule: `base * 2^attempt` capped at `max_delay`, plus up to
/// half a base delay of jitter when enabled.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl BackoffPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            jitter: true,
        }
    }

    /// Deterministic variant for tests and single-caller retry loops.
    pub fn without_jitter(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            jitter: false,
        }
    }

    /// Delay before the attempt after `attempt` failures (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        // checked shift so attempt >= 32 saturates instead of overflowing
        let multiplier = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        let exponential = self
            .base_delay
            .checked_mul(multiplier)
            .unwrap_or(self.max_delay)
            .min(self.max_delay);

        if !self.jitter {
            return exponential;
        }
        exponential + self.jitter_within(self.max_delay.saturating_sub(exponential))
    }

    /// Random extra delay in `[0, base/2)`, clamped so the total never
    /// exceeds `max_delay`.
    fn jitter_within(&self, headroom: Duration) -> Duration {
        let half_base_ms = u64::try_from(self.base_delay.as_millis() / 2).unwrap_or(u64::MAX);
        let headroom_ms = u64::try_from(headroom.as_millis()).unwrap_or(u64::MAX);
        let limit_ms = half_base_ms.min(headroom_ms);
        if limit_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::rng().random_range(0..limit_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_without_jitter_doubles_per_attempt() {
        let policy =
            BackoffPolicy::without_jitter(Duration::from_millis(100), Duration::from_secs(10));
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(800));
    }

    #[test]
    fn test_delay_is_capped_for_large_attempts() {
        let policy =
            BackoffPolicy::without_jitter(Duration::from_millis(100), Duration::from_secs(5));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(5));
        // attempt numbers past the shift width saturate instead of wrapping
        assert_eq!(policy.delay_for_attempt(40), Duration::from_secs(5));
    }

    #[test]
    fn test_jitter_starts_at_base_and_stays_under_half_base_extra() {
        let policy = BackoffPolicy::new(Duration::from_millis(100), Duration::from_secs(10));
        for _ in 0..32 {
            let delay = policy.delay_for_attempt(0);
            assert!(delay >= Duration::from_millis(100));
            assert!(delay < Duration::from_millis(150));
        }
    }

    #[test]
    fn test_jitter_never_exceeds_cap() {
        let policy = BackoffPolicy::new(Duration::from_millis(500), Duration::from_secs(1));
        for attempt in 0..16 {
            assert!(policy.delay_for_attempt(attempt) <= Duration::from_secs(1));
        }
    }

    #[test]
    fn test_zero_base_yields_zero_delay() {
        let policy = BackoffPolicy::new(Duration::ZERO, Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(policy.delay_for_attempt(8), Duration::ZERO);
    }
}
