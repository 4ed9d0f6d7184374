//! Per-service request throttling.

use crate::clock::Clock;
use crate::config::RateLimitConfig;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

/// Counters describing limiter activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RateLimiterStats {
    /// Calls started.
    pub executed: u64,
    /// Total time callers were held back.
    pub waited: Duration,
}

#[derive(Debug, Default)]
struct QueueState {
    next_ticket: u64,
    serving: u64,
    last_start: Option<Duration>,
    stats: RateLimiterStats,
}

/// Serializes calls to one external service and spaces their starts.
///
/// Callers take a ticket and are admitted strictly in ticket order; each
/// admission waits until `min_interval` has passed since the previous start.
/// The operation itself runs outside the queue, so a slow call does not hold
/// up the next admission beyond the configured spacing.
#[derive(Debug)]
pub struct RateLimiter {
    service: String,
    interval: Duration,
    clock: Arc<dyn Clock>,
    state: Mutex<QueueState>,
    turn: Condvar,
}

impl RateLimiter {
    /// Creates a limiter for a service.
    pub fn new(service: impl Into<String>, config: &RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            service: service.into(),
            interval: config.min_interval(),
            clock,
            state: Mutex::new(QueueState::default()),
            turn: Condvar::new(),
        }
    }

    /// Name of the limited service.
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Minimum spacing between call starts.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Runs `operation` once the queue admits it.
    pub fn execute<T, F>(&self, operation: F) -> T
    where
        F: FnOnce() -> T,
    {
        self.admit();
        operation()
    }

    /// Returns activity counters.
    pub fn stats(&self) -> RateLimiterStats {
        self.state.lock().stats
    }

    /// Waits for this caller's turn and returns the admitted start time.
    fn admit(&self) -> Duration {
        let mut state = self.state.lock();
        let ticket = state.next_ticket;
        state.next_ticket += 1;

        while state.serving != ticket {
            self.turn.wait(&mut state);
        }

        if let Some(last) = state.last_start {
            let ready_at = last + self.interval;
            let now = self.clock.now();
            if ready_at > now {
                let wait = ready_at - now;
                trace!(service = %self.service, ticket, wait_ms = wait.as_millis() as u64, "throttling call");
                // Later tickets cannot pass while we hold the turn, so the
                // lock can be released for the sleep.
                MutexGuard::unlocked(&mut state, || self.clock.sleep(wait));
                state.stats.waited += wait;
            }
        }

        let start = self.clock.now();
        state.last_start = Some(start);
        state.stats.executed += 1;
        state.serving += 1;
        self.turn.notify_all();
        start
    }
}
