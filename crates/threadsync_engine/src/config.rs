//! Configuration for the sync engine.

use rand::Rng;
use std::time::Duration;

/// Default number of manifest items requested per page.
pub const DEFAULT_PAGE_LIMIT: u32 = 100;
/// Default upload chunk size (4 MiB).
pub const DEFAULT_CHUNK_SIZE: usize = 4 * 1024 * 1024;
/// Default bound on concurrent transfers.
pub const DEFAULT_MAX_CONCURRENT_TRANSFERS: usize = 3;
/// Default capacity of the idempotency ledger.
pub const DEFAULT_LEDGER_CAPACITY: usize = 4096;

/// Configuration for sync operations.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Thread being mirrored.
    pub thread_id: String,
    /// Device name used in conflict copy names.
    pub device_id: String,
    /// Server base URL.
    pub base_url: String,
    /// Credential profile.
    pub profile_id: String,
    /// Manifest page size.
    pub page_limit: u32,
    /// Upload chunk size in bytes.
    pub chunk_size: usize,
    /// Maximum transfers in flight.
    pub max_concurrent_transfers: usize,
    /// Deadline applied to every network call.
    pub request_timeout: Duration,
    /// Retry configuration.
    pub retry: RetryPolicy,
    /// Whether a pass uploads local edits after pulling.
    pub push_local_changes: bool,
    /// Idempotency ledger capacity.
    pub ledger_capacity: usize,
    /// Interval for periodic passes in watch mode.
    pub sync_interval: Option<Duration>,
    /// Change feed settings.
    pub feed: FeedConfig,
}

impl SyncConfig {
    /// Creates a new sync configuration.
    pub fn new(
        thread_id: impl Into<String>,
        device_id: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            thread_id: thread_id.into(),
            device_id: device_id.into(),
            base_url: base_url.into(),
            profile_id: "default".to_string(),
            page_limit: DEFAULT_PAGE_LIMIT,
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_concurrent_transfers: DEFAULT_MAX_CONCURRENT_TRANSFERS,
            request_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            push_local_changes: true,
            ledger_capacity: DEFAULT_LEDGER_CAPACITY,
            sync_interval: None,
            feed: FeedConfig::default(),
        }
    }

    /// Sets the credential profile.
    pub fn with_profile(mut self, profile_id: impl Into<String>) -> Self {
        self.profile_id = profile_id.into();
        self
    }

    /// Sets the manifest page size.
    pub fn with_page_limit(mut self, limit: u32) -> Self {
        self.page_limit = limit.max(1);
        self
    }

    /// Sets the upload chunk size.
    pub fn with_chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size.max(1);
        self
    }

    /// Sets the transfer concurrency bound.
    pub fn with_max_concurrent_transfers(mut self, max: usize) -> Self {
        self.max_concurrent_transfers = max.max(1);
        self
    }

    /// Sets the request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Enables or disables the push phase.
    pub fn with_push(mut self, push: bool) -> Self {
        self.push_local_changes = push;
        self
    }

    /// Sets the idempotency ledger capacity.
    pub fn with_ledger_capacity(mut self, capacity: usize) -> Self {
        self.ledger_capacity = capacity.max(1);
        self
    }

    /// Sets the sync interval for watch mode.
    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = Some(interval);
        self
    }

    /// Sets the change feed configuration.
    pub fn with_feed(mut self, feed: FeedConfig) -> Self {
        self.feed = feed;
        self
    }
}

/// Retry behaviour shared by every transfer and the feed reconnect loop.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound on computed delays.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add up to 25% random jitter.
    pub jitter: bool,
}

impl RetryPolicy {
    /// Creates a policy with the default delays.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }

    /// Creates a policy with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            jitter: false,
        }
    }

    /// Creates a policy that retries immediately. Used by tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::no_retry()
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
        self.jitter = jitter;
        self
    }

    /// Returns true if another attempt is allowed after `attempts` tries.
    pub fn allows_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    /// Calculates the delay before retry number `attempt` (1-indexed; 0 means
    /// the first try and never waits).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let base = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let delay_secs = base.min(self.max_delay.as_secs_f64());

        if self.jitter && delay_secs > 0.0 {
            let jitter = delay_secs * 0.25 * rand::thread_rng().gen::<f64>();
            Duration::from_secs_f64(delay_secs + jitter)
        } else {
            Duration::from_secs_f64(delay_secs)
        }
    }

    /// Delay before retry `attempt`, honouring a server hint when it asks for
    /// a longer wait than the computed backoff.
    pub fn delay_with_hint(&self, attempt: u32, hint: Option<Duration>) -> Duration {
        let computed = self.delay_for_attempt(attempt);
        match hint {
            Some(hint) if hint > computed => hint,
            _ => computed,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(5)
    }
}

/// Change feed listener settings.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedConfig {
    /// Consecutive failed connections before falling back to a full pass.
    pub max_reconnect_attempts: u32,
    /// Backoff between reconnects.
    pub reconnect: RetryPolicy,
    /// A stream silent for longer than this is treated as dead.
    pub idle_timeout: Duration,
}

impl FeedConfig {
    /// Sets the reconnect ceiling.
    pub fn with_max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts.max(1);
        self
    }

    /// Sets the reconnect backoff.
    pub fn with_reconnect(mut self, policy: RetryPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    /// Sets the idle timeout.
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: 5,
            reconnect: RetryPolicy::new(u32::MAX)
                .with_initial_delay(Duration::from_millis(500))
                .with_max_delay(Duration::from_secs(60)),
            idle_timeout: Duration::from_secs(90),
        }
    }
}
