//! Monotonic deadline helper used by every bounded wait in the agent.

use std::thread;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

/// A cutoff armed at construction. Each `tick` sleeps one interval while time remains.
#[derive(Debug, Clone)]
pub struct Timeout {
    deadline: Instant,
    interval: Duration,
    what: String,
}

impl Timeout {
    pub fn new(timeout: Duration, interval: Duration, what: impl Into<String>) -> Self {
        Self {
            deadline: Instant::now() + timeout,
            interval,
            what: what.into(),
        }
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn set_interval(&mut self, interval: Duration) {
        self.interval = interval;
    }

    /// Pushes the deadline out to at least `at_least` from now. Never shrinks it.
    pub fn extend(&mut self, at_least: Duration) {
        let candidate = Instant::now() + at_least;
        if candidate > self.deadline {
            self.deadline = candidate;
        }
    }

    /// Sleeps one interval (capped at the remaining time) and returns `true`, or returns `false`
    /// without sleeping once the deadline has passed.
    pub fn tick(&mut self) -> bool {
        let remaining = self.remaining();
        if remaining.is_zero() {
            return false;
        }
        thread::sleep(self.interval.min(remaining));
        true
    }

    /// Like `tick`, but expiry is reported as `Error::TimedOut`.
    pub fn tick_or_fail(&mut self) -> Result<()> {
        if self.tick() {
            Ok(())
        } else {
            Err(Error::TimedOut {
                what: self.what.clone(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_reports_expiry() {
        let mut timeout = Timeout::new(Duration::from_millis(30), Duration::from_millis(10), "x");
        let mut ticks = 0;
        while timeout.tick() {
            ticks += 1;
            assert!(ticks < 100, "tick never expired");
        }
        assert!(timeout.expired());
        assert!(ticks >= 1);
    }

    #[test]
    fn tick_or_fail_raises_timed_out() {
        let mut timeout = Timeout::new(Duration::ZERO, Duration::from_millis(1), "pidfile");
        let err = timeout.tick_or_fail().unwrap_err();
        match err {
            Error::TimedOut { what } => assert_eq!(what, "pidfile"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn extend_never_shrinks_deadline() {
        let mut timeout = Timeout::new(Duration::from_secs(60), Duration::from_millis(1), "x");
        timeout.extend(Duration::from_secs(1));
        assert!(timeout.remaining() > Duration::from_secs(50));
        timeout.extend(Duration::from_secs(120));
        assert!(timeout.remaining() > Duration::from_secs(100));
    }
}
