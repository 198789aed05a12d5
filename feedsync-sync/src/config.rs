//! Configuration for the sync engine.

use std::time::Duration;

/// Configuration for sync operations.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// How long a tombstone is kept before it may be purged.
    pub tombstone_grace: Duration,
    /// Upper bound on a single remote write.
    pub mutation_timeout: Duration,
    /// Interval of the background tombstone purge.
    pub purge_interval: Duration,
    /// Buffer size of the notice channel.
    pub notice_capacity: usize,
    /// Backoff for snapshot fetches during resync.
    pub resync_retry: RetryConfig,
}

impl SyncConfig {
    /// Sets the tombstone grace period.
    pub fn with_tombstone_grace(mut self, grace: Duration) -> Self {
        self.tombstone_grace = grace;
        self
    }

    /// Sets the mutation timeout.
    pub fn with_mutation_timeout(mut self, timeout: Duration) -> Self {
        self.mutation_timeout = timeout;
        self
    }

    /// Sets the purge interval.
    pub fn with_purge_interval(mut self, interval: Duration) -> Self {
        self.purge_interval = interval;
        self
    }

    /// Sets the notice channel capacity.
    pub fn with_notice_capacity(mut self, capacity: usize) -> Self {
        self.notice_capacity = capacity;
        self
    }

    /// Sets the resync retry configuration.
    pub fn with_resync_retry(mut self, retry: RetryConfig) -> Self {
        self.resync_retry = retry;
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            tombstone_grace: Duration::from_secs(5 * 60),
            mutation_timeout: Duration::from_secs(30),
            purge_interval: Duration::from_secs(60),
            notice_capacity: 256,
            resync_retry: RetryConfig::default(),
        }
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, the first one included.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Cap on any single delay.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add up to 25% random jitter to delays.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a retry configuration with the given attempt budget.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// Creates a configuration that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enables or disables jitter.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.add_jitter = jitter;
        self
    }

    /// The delay before retry number `attempt` (0 is the first call, which
    /// never waits).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let base = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let capped = base.min(self.max_delay.as_secs_f64());

        if self.add_jitter {
            Duration::from_secs_f64(capped + capped * 0.25 * rand::random::<f64>())
        } else {
            Duration::from_secs_f64(capped)
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(5)
    }
}
