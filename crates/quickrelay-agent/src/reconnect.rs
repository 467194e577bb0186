//! Redial backoff for the agent's outer loop

use std::time::Duration;

const INITIAL_DELAY: Duration = Duration::from_secs(1);
const MAX_DELAY: Duration = Duration::from_secs(60);

/// Doubling delay between relay redials, reset once a session is established
#[derive(Debug, Clone)]
pub struct Backoff {
    delay: Duration,
    failures: usize,
    /// Give up after this many consecutive failures (None = never)
    limit: Option<usize>,
}

impl Backoff {
    pub fn new(limit: Option<usize>) -> Self {
        Self {
            delay: INITIAL_DELAY,
            failures: 0,
            limit,
        }
    }

    /// Record a failure and return how long to wait, or None once the limit is hit
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.limit.is_some_and(|limit| self.failures >= limit) {
            return None;
        }
        self.failures += 1;

        let delay = self.delay;
        self.delay = (self.delay * 2).min(MAX_DELAY);
        Some(delay)
    }

    pub fn reset(&mut self) {
        self.delay = INITIAL_DELAY;
        self.failures = 0;
    }

    /// Consecutive failures since the last reset
    pub fn failures(&self) -> usize {
        self.failures
    }
}
