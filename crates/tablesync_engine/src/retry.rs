//! Bounded retry with exponential backoff, and the guarded call wrapper.

use crate::clock::Clock;
use crate::config::{RateLimitConfig, RetryConfig};
use crate::error::{ErrorKind, SyncError, SyncResult};
use crate::rate_limit::RateLimiter;
use std::sync::Arc;
use tracing::{debug, warn};

/// Retries fallible operations according to a [`RetryConfig`].
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    config: RetryConfig,
    clock: Arc<dyn Clock>,
}

impl RetryExecutor {
    /// Creates an executor.
    pub fn new(config: RetryConfig, clock: Arc<dyn Clock>) -> Self {
        Self { config, clock }
    }

    /// Returns the retry configuration.
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Runs `operation` until it succeeds, fails with a non-retryable error,
    /// or `max_attempts` is reached.
    ///
    /// The final error is wrapped in [`SyncError::OperationFailed`] with its
    /// kind (falling back to `phase_kind`) and the number of attempts made.
    pub fn retry<T, F>(&self, operation: &str, phase_kind: ErrorKind, mut f: F) -> SyncResult<T>
    where
        F: FnMut() -> SyncResult<T>,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let err = match f() {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(operation, attempt, "operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            if !err.is_retryable() || attempt >= max_attempts {
                if err.is_retryable() {
                    warn!(operation, attempts = attempt, error = %err, "giving up after maximum attempts");
                } else {
                    debug!(operation, error = %err, "error is not retryable");
                }
                return Err(wrap(operation, attempt, phase_kind, err));
            }

            let mut delay = self.config.delay_for_attempt(attempt);
            if let SyncError::Endpoint(endpoint) = &err {
                if let Some(after) = endpoint.retry_after() {
                    delay = delay.max(after);
                }
            }
            warn!(
                operation,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "operation failed, retrying"
            );
            self.clock.sleep(delay);
        }
    }
}

fn wrap(operation: &str, attempts: u32, phase_kind: ErrorKind, err: SyncError) -> SyncError {
    if matches!(err, SyncError::OperationFailed { .. }) {
        return err;
    }
    SyncError::OperationFailed {
        operation: operation.to_string(),
        attempts,
        kind: err.kind_or(phase_kind),
        source: Box::new(err),
    }
}

/// Rate limiter plus retry executor for one external service.
///
/// Every attempt of a retried call queues on the limiter again, so retries
/// never exceed the service's request ceiling.
#[derive(Debug)]
pub struct ApiGuard {
    limiter: RateLimiter,
    retry: RetryExecutor,
}

impl ApiGuard {
    /// Creates a guard for a service.
    pub fn new(
        service: impl Into<String>,
        rate: &RateLimitConfig,
        retry: RetryConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            limiter: RateLimiter::new(service, rate, Arc::clone(&clock)),
            retry: RetryExecutor::new(retry, clock),
        }
    }

    /// Returns the rate limiter.
    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Runs `f` through the limiter, retrying per the retry configuration.
    pub fn call<T, F>(&self, operation: &str, phase_kind: ErrorKind, mut f: F) -> SyncResult<T>
    where
        F: FnMut() -> SyncResult<T>,
    {
        self.retry
            .retry(operation, phase_kind, || self.limiter.execute(&mut f))
    }
}
