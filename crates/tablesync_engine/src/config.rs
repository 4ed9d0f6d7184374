//! Configuration for the sync engine.

use rand::Rng;
use std::time::Duration;

/// Default time-to-live of cross-reference cache entries.
pub const DEFAULT_CROSS_REF_TTL: Duration = Duration::from_secs(5 * 60);

/// Chunks in flight per phase when the rate limit is disabled.
const UNLIMITED_IN_FLIGHT: usize = 8;

/// Engine-wide settings, independent of any one sync configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Rate limit for the record endpoint.
    pub left_rate_limit: RateLimitConfig,
    /// Rate limit for the spreadsheet endpoint.
    pub right_rate_limit: RateLimitConfig,
    /// Retry configuration for every external call.
    pub retry: RetryConfig,
    /// Lifetime of cross-reference cache entries.
    pub cross_ref_ttl: Duration,
    /// Rows requested per page when listing.
    pub page_size: u32,
}

impl EngineConfig {
    /// Creates the default configuration.
    pub fn new() -> Self {
        Self {
            left_rate_limit: RateLimitConfig::new(5),
            right_rate_limit: RateLimitConfig::new(5),
            retry: RetryConfig::default(),
            cross_ref_ttl: DEFAULT_CROSS_REF_TTL,
            page_size: 100,
        }
    }

    /// Sets the record endpoint rate limit.
    pub fn with_left_rate_limit(mut self, rate: RateLimitConfig) -> Self {
        self.left_rate_limit = rate;
        self
    }

    /// Sets the spreadsheet endpoint rate limit.
    pub fn with_right_rate_limit(mut self, rate: RateLimitConfig) -> Self {
        self.right_rate_limit = rate;
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the cross-reference cache TTL.
    pub fn with_cross_ref_ttl(mut self, ttl: Duration) -> Self {
        self.cross_ref_ttl = ttl;
        self
    }

    /// Sets the list page size.
    pub fn with_page_size(mut self, size: u32) -> Self {
        self.page_size = size.max(1);
        self
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-service request ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Requests per second; zero disables limiting.
    pub requests_per_second: u32,
}

impl RateLimitConfig {
    /// Creates a rate limit.
    pub fn new(requests_per_second: u32) -> Self {
        Self {
            requests_per_second,
        }
    }

    /// No limit.
    pub fn unlimited() -> Self {
        Self::new(0)
    }

    /// Minimum delay between two call starts.
    pub fn min_interval(&self) -> Duration {
        if self.requests_per_second == 0 {
            Duration::ZERO
        } else {
            Duration::from_nanos(1_000_000_000 / u64::from(self.requests_per_second))
        }
    }

    /// Write chunks dispatched at once; the limiter is what actually paces them.
    pub fn max_in_flight(&self) -> usize {
        match self.requests_per_second {
            0 => UNLIMITED_IN_FLIGHT,
            rps => rps as usize,
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self::new(5)
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first.
    pub max_attempts: u32,
    /// Delay after the first failed attempt.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a new retry configuration.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// Creates a configuration with no retries.
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
    pub fn with_jitter(mut self, add_jitter: bool) -> Self {
        self.add_jitter = add_jitter;
        self
    }

    /// Calculates the delay after a failed attempt (1-indexed).
    ///
    /// `initial_delay * multiplier^(attempt-1)`, capped at `max_delay`, plus
    /// up to 25% jitter.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let base_delay =
            self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);

        let delay_secs = base_delay.min(self.max_delay.as_secs_f64());

        if self.add_jitter && delay_secs > 0.0 {
            let jitter = delay_secs * 0.25 * rand::thread_rng().gen_range(0.0..1.0);
            Duration::from_secs_f64(delay_secs + jitter)
        } else {
            Duration::from_secs_f64(delay_secs)
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}
