use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for attempt retry behavior.
///
/// Controls how many times a run should retry on failed attempts and the
/// backoff between attempts. The engine compares the computed delay against
/// its retry-immediately threshold to decide whether the runner retries in
/// place or the run goes back through the queue.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first try.
    pub max_attempts: u32,

    /// Delay before the first retry.
    pub initial_delay: Duration,

    /// Cap applied to the exponential backoff.
    pub max_delay: Duration,

    /// Each retry delay is `min(initial_delay * multiplier^(attempt-1), max_delay)`.
    pub backoff_multiplier: f64,
}

impl RetryPolicy {
    /// No retries: fail terminally on the first error.
    pub const NONE: Self = Self {
        max_attempts: 1,
        initial_delay: Duration::from_secs(0),
        max_delay: Duration::from_secs(0),
        backoff_multiplier: 1.0,
    };

    /// Sensible default: 3 attempts, 1s initial delay, doubling, capped at 30s.
    pub const STANDARD: Self = Self {
        max_attempts: 3,
        initial_delay: Duration::from_secs(1),
        max_delay: Duration::from_secs(30),
        backoff_multiplier: 2.0,
    };

    /// For critical work: 10 attempts starting at 100ms, 1.5x, capped at 10s.
    pub const AGGRESSIVE: Self = Self {
        max_attempts: 10,
        initial_delay: Duration::from_millis(100),
        max_delay: Duration::from_secs(10),
        backoff_multiplier: 1.5,
    };

    /// Delay before retrying after the given (1-based) failed attempt.
    ///
    /// Attempt 1 failing waits `initial_delay`, attempt 2 waits
    /// `initial_delay * multiplier`, and so on, capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return self.initial_delay;
        }
        let factor = self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);
        let raw = self.initial_delay.as_secs_f64() * factor;
        let capped = raw.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped)
    }

    /// True if another attempt is allowed after `attempt` attempts ran.
    pub fn can_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::STANDARD
    }
}
