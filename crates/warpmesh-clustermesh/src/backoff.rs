//! Exponential reconnect backoff.

use std::time::Duration;

/// Doubling backoff between `base` and `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    current: Duration,
    failures: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            current: base,
            failures: 0,
        }
    }

    /// Record a failure and return how long to wait before retrying.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.failures += 1;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    /// Back to the base interval (after a successful connection).
    pub fn reset(&mut self) {
        self.current = self.base;
        self.failures = 0;
    }

    /// Consecutive failures since the last reset.
    pub fn failures(&self) -> u32 {
        self.failures
    }
}
