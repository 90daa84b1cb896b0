//! Time source used by the key pool and the request executor.
//!
//! Production code runs on [`SystemClock`]. [`ManualClock`] never blocks:
//! sleeping advances its notion of "now", which lets cooldown and backoff
//! behaviour be exercised deterministically.

use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use super::cancel::CancelToken;

/// A source of monotonic time that can also sleep.
pub trait Clock: Send + Sync {
    /// Current monotonic instant.
    fn now(&self) -> Instant;

    /// Sleep for `duration` unless `cancel` fires first.
    ///
    /// Returns `false` if the sleep was interrupted by cancellation.
    fn sleep(&self, duration: Duration, cancel: &CancelToken) -> bool;
}

/// Wall-clock implementation backed by [`Instant::now`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration, cancel: &CancelToken) -> bool {
        if duration.is_zero() {
            return !cancel.is_cancelled();
        }
        !cancel.wait_timeout(duration)
    }
}

/// Simulated clock for tests: `sleep` advances time instantly.
#[derive(Debug)]
pub struct ManualClock {
    origin: Instant,
    offset: Mutex<Duration>,
    slept: Mutex<Vec<Duration>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
            slept: Mutex::new(Vec::new()),
        }
    }

    /// Move simulated time forward.
    pub fn advance(&self, by: Duration) {
        let mut offset = self.offset.lock().unwrap_or_else(PoisonError::into_inner);
        *offset += by;
    }

    /// Total simulated time elapsed since construction.
    pub fn elapsed(&self) -> Duration {
        *self.offset.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Every sleep requested so far, in order.
    pub fn sleeps(&self) -> Vec<Duration> {
        self.slept
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + self.elapsed()
    }

    fn sleep(&self, duration: Duration, cancel: &CancelToken) -> bool {
        if cancel.is_cancelled() {
            return false;
        }
        self.slept
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(duration);
        self.advance(duration);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_sleep_advances_time() {
        let clock = ManualClock::new();
        let start = clock.now();
        assert!(clock.sleep(Duration::from_secs(60), &CancelToken::new()));
        assert_eq!(clock.now() - start, Duration::from_secs(60));
        assert_eq!(clock.sleeps(), vec![Duration::from_secs(60)]);
    }

    #[test]
    fn manual_sleep_respects_cancellation() {
        let clock = ManualClock::new();
        let token = CancelToken::new();
        token.cancel();
        assert!(!clock.sleep(Duration::from_secs(1), &token));
        assert_eq!(clock.elapsed(), Duration::ZERO);
    }

    #[test]
    fn system_zero_sleep_returns_immediately() {
        assert!(SystemClock.sleep(Duration::ZERO, &CancelToken::new()));
    }
}
