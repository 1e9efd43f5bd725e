//! Backoff between retry attempts and while spinning on a locked orec.

use std::time::Duration;
use tessera_core::BackoffConfig;

/// Spins between two `yield_now` calls while waiting on a locked orec.
pub const SPIN_YIELD: u32 = 8;

/// Yield the thread every [`SPIN_YIELD`] spins.
///
/// Called from the orec CAS loops with the number of spins left.
#[inline]
pub fn spin_yield(remaining: i64) {
    if remaining % SPIN_YIELD as i64 == 0 {
        std::thread::yield_now();
    } else {
        std::hint::spin_loop();
    }
}

/// Action taken for one backoff attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffAction {
    /// Yield the current thread
    Yield,
    /// Sleep for the given duration
    Sleep(Duration),
}

/// Pluggable backoff strategy used by the retry driver after a conflict.
pub trait BackoffPolicy: Send + Sync {
    /// Decide what to do before attempt `attempt` (1-based count of failures so far).
    fn action(&self, attempt: u32) -> BackoffAction;

    /// Perform the delay for `attempt`.
    fn delay(&self, attempt: u32) {
        match self.action(attempt) {
            BackoffAction::Yield => std::thread::yield_now(),
            BackoffAction::Sleep(d) => std::thread::sleep(d),
        }
    }
}

/// Yield for the first few attempts, then sleep with exponentially growing
/// delays capped at `max_delay`.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    yield_attempts: u32,
    min_delay: Duration,
    max_delay: Duration,
}

impl ExponentialBackoff {
    /// Create a backoff policy.
    pub fn new(yield_attempts: u32, min_delay: Duration, max_delay: Duration) -> Self {
        ExponentialBackoff {
            yield_attempts,
            min_delay,
            max_delay: max_delay.max(min_delay),
        }
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        ExponentialBackoff::from(&BackoffConfig::default())
    }
}

impl From<&BackoffConfig> for ExponentialBackoff {
    fn from(config: &BackoffConfig) -> Self {
        ExponentialBackoff::new(
            config.yield_attempts,
            Duration::from_micros(config.min_delay_us),
            Duration::from_micros(config.max_delay_us),
        )
    }
}

impl BackoffPolicy for ExponentialBackoff {
    fn action(&self, attempt: u32) -> BackoffAction {
        if attempt <= self.yield_attempts {
            return BackoffAction::Yield;
        }
        let shift = (attempt - self.yield_attempts - 1).min(20);
        let delay = self
            .min_delay
            .checked_mul(1u32 << shift)
            .unwrap_or(self.max_delay)
            .min(self.max_delay);
        BackoffAction::Sleep(delay)
    }
}

/// Never sleeps; only yields. Useful for tests and benchmarks.
#[derive(Debug, Clone, Copy, Default)]
pub struct YieldBackoff;

impl BackoffPolicy for YieldBackoff {
    fn action(&self, _attempt: u32) -> BackoffAction {
        BackoffAction::Yield
    }
}
