//! Retry backoff for transient failures.
//!
//! Exponential backoff with a capped base delay plus random jitter, so that
//! many devices coming back online at once do not retry in lockstep.
//!
//! Formula: `min(cap, base * 2^(attempt-1)) + random(0..=max_jitter)`

use std::time::Duration;

/// Backoff parameters for retrying failed sync cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay of the first retry (before jitter).
    pub base: Duration,
    /// Upper bound of the exponential part.
    pub cap: Duration,
    /// Upper bound of the random jitter added to every delay.
    pub max_jitter: Duration,
}

impl RetryPolicy {
    /// Create a policy with the given base and cap and no jitter.
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            max_jitter: Duration::ZERO,
        }
    }

    /// Set the jitter bound.
    pub fn with_jitter(mut self, max_jitter: Duration) -> Self {
        self.max_jitter = max_jitter;
        self
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let base = self
            .base
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.cap)
            .min(self.cap);

        base + self.jitter()
    }

    fn jitter(&self) -> Duration {
        let bound = self.max_jitter.as_millis() as u64;
        if bound == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(random_u64() % (bound + 1))
    }
}

impl Default for RetryPolicy {
    /// 1s base, 60s cap, up to 1s jitter.
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(60),
            max_jitter: Duration::from_secs(1),
        }
    }
}

/// A random u64, or 0 if the OS source is unavailable.
fn random_u64() -> u64 {
    let mut bytes = [0u8; 8];
    match getrandom::getrandom(&mut bytes) {
        Ok(()) => u64::from_le_bytes(bytes),
        Err(_) => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_per_attempt() {
        let policy = RetryPolicy::new(Duration::from_secs(1), Duration::from_secs(60));
        assert_eq!(policy.delay(1), Duration::from_secs(1));
        assert_eq!(policy.delay(2), Duration::from_secs(2));
        assert_eq!(policy.delay(3), Duration::from_secs(4));
        assert_eq!(policy.delay(4), Duration::from_secs(8));
    }

    #[test]
    fn attempt_zero_behaves_like_first() {
        let policy = RetryPolicy::new(Duration::from_millis(500), Duration::from_secs(60));
        assert_eq!(policy.delay(0), Duration::from_millis(500));
    }

    #[test]
    fn backoff_is_capped() {
        let policy = RetryPolicy::new(Duration::from_secs(1), Duration::from_secs(30));
        assert_eq!(policy.delay(10), Duration::from_secs(30));
        assert_eq!(policy.delay(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn jitter_stays_within_bound() {
        let policy = RetryPolicy::new(Duration::from_secs(2), Duration::from_secs(30))
            .with_jitter(Duration::from_millis(500));

        for _ in 0..50 {
            let delay = policy.delay(1);
            assert!(delay >= Duration::from_secs(2));
            assert!(delay <= Duration::from_millis(2500));
        }
    }

    #[test]
    fn jitter_creates_variance() {
        let policy = RetryPolicy::new(Duration::from_secs(1), Duration::from_secs(30))
            .with_jitter(Duration::from_secs(5));

        let delays: Vec<Duration> = (0..20).map(|_| policy.delay(3)).collect();
        let min = delays.iter().min().unwrap();
        let max = delays.iter().max().unwrap();

        // 20 samples over 5001 jitter values; a collision on all of them is
        // vanishingly unlikely.
        assert!(
            max.as_millis() - min.as_millis() >= 100,
            "Expected jitter variance, got min={:?} max={:?}",
            min,
            max
        );
    }

    #[test]
    fn default_policy() {
        let policy = RetryPolicy::default();
        assert!(policy.delay(1) >= Duration::from_secs(1));
        assert!(policy.delay(100) <= Duration::from_secs(61));
    }
}
