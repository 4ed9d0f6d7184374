//! Time source abstraction.
//!
//! The rate limiter, the retry executor and the cross-reference cache read
//! time through [`Clock`] so tests can drive them with [`MockClock`].

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::fmt;
use std::time::{Duration, Instant};

/// A monotonic time source that can also sleep.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Monotonic time since the clock's origin.
    fn now(&self) -> Duration;

    /// Current wall-clock time.
    fn wall(&self) -> DateTime<Utc>;

    /// Blocks the calling thread for `duration`.
    fn sleep(&self, duration: Duration);
}

/// The real clock.
#[derive(Debug)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    /// Creates a clock whose origin is now.
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    fn wall(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn sleep(&self, duration: Duration) {
        if !duration.is_zero() {
            std::thread::sleep(duration);
        }
    }
}

/// A manually driven clock for tests.
///
/// `sleep` returns immediately after advancing the clock, and every sleep is
/// recorded.
#[derive(Debug)]
pub struct MockClock {
    elapsed: Mutex<Duration>,
    wall_origin: DateTime<Utc>,
    sleeps: Mutex<Vec<Duration>>,
}

impl MockClock {
    /// Creates a clock at time zero whose wall time starts at `wall_origin`.
    pub fn new(wall_origin: DateTime<Utc>) -> Self {
        Self {
            elapsed: Mutex::new(Duration::ZERO),
            wall_origin,
            sleeps: Mutex::new(Vec::new()),
        }
    }

    /// Moves time forward.
    pub fn advance(&self, duration: Duration) {
        *self.elapsed.lock() += duration;
    }

    /// Every sleep requested so far.
    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().clone()
    }

    /// Total time spent sleeping.
    pub fn total_slept(&self) -> Duration {
        self.sleeps.lock().iter().sum()
    }
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new(DateTime::<Utc>::UNIX_EPOCH)
    }
}

impl Clock for MockClock {
    fn now(&self) -> Duration {
        *self.elapsed.lock()
    }

    fn wall(&self) -> DateTime<Utc> {
        let elapsed = chrono::Duration::from_std(self.now()).unwrap_or(chrono::Duration::zero());
        self.wall_origin + elapsed
    }

    fn sleep(&self, duration: Duration) {
        self.sleeps.lock().push(duration);
        self.advance(duration);
    }
}
