//! Sync client configuration.

use std::time::Duration;
use sync_core::{ConflictPolicy, RetryPolicy};
use sync_types::DeviceId;

/// Configuration for [`SyncClient`](crate::SyncClient).
///
/// ```ignore
/// let config = ClientConfig::new(device_id)
///     .with_batch_size(50)
///     .with_conflict_policy(ConflictPolicy::LastWriterWins);
/// ```
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// This device.
    pub device_id: DeviceId,
    /// Maximum events per push request.
    pub push_batch_size: usize,
    /// Maximum entries requested per pull page.
    pub pull_limit: u32,
    /// Failed attempts after which an event stalls.
    pub max_attempts: u32,
    /// Queue size cap; `enqueue` fails beyond it.
    pub max_pending: u64,
    /// Age after which an undelivered event moves to dead-letter.
    pub max_pending_age: Duration,
    /// Timeout for a single push or pull request.
    pub request_timeout: Duration,
    /// Backoff between failed cycles.
    pub retry: RetryPolicy,
    /// How irreconcilable field conflicts are settled.
    pub conflict_policy: ConflictPolicy,
    /// Upper bound on push rounds within one cycle.
    pub max_push_rounds: usize,
    /// Period of the background sync timer.
    pub sync_interval: Duration,
}

impl ClientConfig {
    /// Default configuration for a device.
    pub fn new(device_id: DeviceId) -> Self {
        Self {
            device_id,
            push_batch_size: 100,
            pull_limit: 500,
            max_attempts: 10,
            max_pending: 10_000,
            max_pending_age: Duration::from_secs(7 * 24 * 60 * 60),
            request_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            conflict_policy: ConflictPolicy::default(),
            max_push_rounds: 32,
            sync_interval: Duration::from_secs(60),
        }
    }

    /// Set the push batch size.
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.push_batch_size = size.max(1);
        self
    }

    /// Set the pull page size.
    pub fn with_pull_limit(mut self, limit: u32) -> Self {
        self.pull_limit = limit.max(1);
        self
    }

    /// Set the per-event attempt ceiling.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Set the queue size cap.
    pub fn with_max_pending(mut self, max: u64) -> Self {
        self.max_pending = max;
        self
    }

    /// Set the dead-letter age.
    pub fn with_max_pending_age(mut self, age: Duration) -> Self {
        self.max_pending_age = age;
        self
    }

    /// Set the request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the retry backoff.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the conflict policy.
    pub fn with_conflict_policy(mut self, policy: ConflictPolicy) -> Self {
        self.conflict_policy = policy;
        self
    }

    /// Set the background sync period.
    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = interval;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = ClientConfig::new(DeviceId::new());
        assert_eq!(config.push_batch_size, 100);
        assert_eq!(config.max_attempts, 10);
        assert_eq!(config.conflict_policy, ConflictPolicy::ServerWins);
    }

    #[test]
    fn builders_clamp_to_sane_minimums() {
        let config = ClientConfig::new(DeviceId::new())
            .with_batch_size(0)
            .with_max_attempts(0)
            .with_pull_limit(0);

        assert_eq!(config.push_batch_size, 1);
        assert_eq!(config.max_attempts, 1);
        assert_eq!(config.pull_limit, 1);
    }
}
