//! Delay before the next connection attempt.
//!
//! Linear with a cap: `delay(attempt) = min(max, base * attempt)`. Attempts
//! start at 1 for the first failed cycle and reset to 0 once a session reaches
//! `Connected`.

use std::time::Duration;

/// Default delay unit.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(2);

/// Default upper bound.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(60);

/// Per-device reconnect backoff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectBackoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY)
    }
}

impl ReconnectBackoff {
    /// Creates a backoff with the given base and cap. A cap below the base is
    /// raised to the base.
    #[must_use]
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            attempt: 0,
        }
    }

    /// Delay for a given attempt number.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        self.base.saturating_mul(attempt).min(self.max)
    }

    /// Records a failed cycle and returns the delay before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        self.delay_for(self.attempt)
    }

    /// Delay the next failure would produce, without recording it.
    #[must_use]
    pub fn peek_delay(&self) -> Duration {
        self.delay_for(self.attempt.saturating_add(1))
    }

    /// Forgets all failures.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Failed cycles since the last reset.
    #[must_use]
    pub const fn attempt(&self) -> u32 {
        self.attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_then_capped() {
        let mut backoff = ReconnectBackoff::default();
        let delays: Vec<u64> = (0..35).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(&delays[..4], &[2, 4, 6, 8]);
        assert_eq!(delays[29], 60);
        assert_eq!(delays[34], 60);
        assert_eq!(backoff.attempt(), 35);
    }

    #[test]
    fn test_non_decreasing_and_bounded() {
        let backoff = ReconnectBackoff::new(Duration::from_millis(750), Duration::from_secs(10));
        let mut previous = Duration::ZERO;
        for attempt in 0..200 {
            let delay = backoff.delay_for(attempt);
            assert!(delay >= previous);
            assert!(delay <= Duration::from_secs(10));
            previous = delay;
        }
        assert_eq!(backoff.delay_for(u32::MAX), Duration::from_secs(10));
    }

    #[test]
    fn test_reset_returns_to_base() {
        let mut backoff = ReconnectBackoff::default();
        backoff.next_delay();
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.peek_delay(), DEFAULT_BASE_DELAY);
        assert_eq!(backoff.next_delay(), DEFAULT_BASE_DELAY);
    }

    #[test]
    fn test_cap_below_base_is_raised() {
        let backoff = ReconnectBackoff::new(Duration::from_secs(5), Duration::from_secs(1));
        assert_eq!(backoff.delay_for(3), Duration::from_secs(5));
    }
}
