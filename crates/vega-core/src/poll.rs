//! Poll failure tracking and escalation.
//!
//! The device actor issues one telemetry request at a time. [`PollTracker`]
//! keeps the failure streak and the time of the last decoded reading, and
//! tells the actor when the session has to be rebuilt.

use std::time::Duration;

use tokio::time::Instant;

/// Shortest allowed poll interval.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Longest allowed poll interval.
pub const MAX_POLL_INTERVAL: Duration = Duration::from_secs(60);

/// Clamps a requested interval into the supported range.
#[must_use]
pub fn clamp_interval(interval: Duration) -> Duration {
    interval.clamp(MIN_POLL_INTERVAL, MAX_POLL_INTERVAL)
}

/// When a poll loop gives up on its session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    interval: Duration,
    /// Consecutive transport failures that trigger a reconnect.
    pub failure_threshold: u32,
    /// Time without a decoded reading that triggers a reconnect.
    pub staleness_timeout: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            failure_threshold: 3,
            staleness_timeout: Duration::from_secs(30),
        }
    }
}

impl PollPolicy {
    /// Creates a policy; the interval is clamped and a zero threshold becomes 1.
    #[must_use]
    pub fn new(interval: Duration, failure_threshold: u32, staleness_timeout: Duration) -> Self {
        Self {
            interval: clamp_interval(interval),
            failure_threshold: failure_threshold.max(1),
            staleness_timeout,
        }
    }

    /// Time between the end of one round trip and the start of the next.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        self.interval
    }
}

/// Outcome of recording a poll result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollVerdict {
    /// Keep polling.
    Continue,
    /// The failure streak reached the threshold.
    TooManyFailures(u32),
    /// No reading for longer than the staleness window.
    Stale(Duration),
}

/// Failure streak and staleness for one connected session.
#[derive(Debug, Clone)]
pub struct PollTracker {
    policy: PollPolicy,
    failures: u32,
    last_success: Instant,
    last_reading: Option<Instant>,
}

impl PollTracker {
    /// Starts tracking at `now`; the staleness window runs from here.
    #[must_use]
    pub const fn new(policy: PollPolicy, now: Instant) -> Self {
        Self {
            policy,
            failures: 0,
            last_success: now,
            last_reading: None,
        }
    }

    /// A reading was decoded.
    pub fn record_success(&mut self, now: Instant) {
        self.failures = 0;
        self.last_success = now;
        self.last_reading = Some(now);
    }

    /// The device answered but the buffer held no real-time record.
    pub fn record_empty(&mut self, now: Instant) -> PollVerdict {
        self.failures = 0;
        self.check_stale(now)
    }

    /// The round trip failed at the transport level.
    pub fn record_failure(&mut self, now: Instant) -> PollVerdict {
        self.failures = self.failures.saturating_add(1);
        if self.failures >= self.policy.failure_threshold {
            return PollVerdict::TooManyFailures(self.failures);
        }
        self.check_stale(now)
    }

    /// Checks the staleness window on its own.
    #[must_use]
    pub fn check_stale(&self, now: Instant) -> PollVerdict {
        let idle = now.saturating_duration_since(self.last_success);
        if idle > self.policy.staleness_timeout {
            PollVerdict::Stale(idle)
        } else {
            PollVerdict::Continue
        }
    }

    /// Current failure streak.
    #[must_use]
    pub const fn consecutive_failures(&self) -> u32 {
        self.failures
    }

    /// When the last reading was decoded, if any.
    #[must_use]
    pub const fn last_reading(&self) -> Option<Instant> {
        self.last_reading
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    #[test]
    fn test_interval_is_clamped() {
        assert_eq!(clamp_interval(Duration::from_millis(10)), MIN_POLL_INTERVAL);
        assert_eq!(clamp_interval(secs(600)), MAX_POLL_INTERVAL);
        assert_eq!(PollPolicy::default().interval(), secs(1));
        assert_eq!(PollPolicy::new(secs(2), 0, secs(30)).failure_threshold, 1);
    }

    #[test]
    fn test_two_failures_then_success_resets_streak() {
        let start = Instant::now();
        let mut tracker = PollTracker::new(PollPolicy::default(), start);
        assert_eq!(tracker.record_failure(start + secs(1)), PollVerdict::Continue);
        assert_eq!(tracker.record_failure(start + secs(2)), PollVerdict::Continue);
        tracker.record_success(start + secs(3));
        assert_eq!(tracker.consecutive_failures(), 0);
        assert_eq!(tracker.last_reading(), Some(start + secs(3)));
    }

    #[test]
    fn test_threshold_escalates() {
        let start = Instant::now();
        let mut tracker = PollTracker::new(PollPolicy::default(), start);
        tracker.record_failure(start);
        tracker.record_failure(start);
        assert_eq!(tracker.record_failure(start), PollVerdict::TooManyFailures(3));
    }

    #[test]
    fn test_empty_answers_go_stale() {
        let start = Instant::now();
        let mut tracker = PollTracker::new(PollPolicy::default(), start);
        tracker.record_failure(start);
        assert_eq!(tracker.record_empty(start + secs(10)), PollVerdict::Continue);
        assert_eq!(tracker.consecutive_failures(), 0);
        assert_eq!(tracker.last_reading(), None);
        assert_eq!(
            tracker.record_empty(start + secs(31)),
            PollVerdict::Stale(secs(31))
        );
    }
}
