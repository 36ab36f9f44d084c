//! # Lifecycle
//!
//! Deadlines and timeouts for blocking waits between kernel threads.
//!
//! ## Philosophy
//!
//! - **Blocking, not async**: Waiters park on a condition variable until a
//!   [`Deadline`]
//! - **Relative in configuration, absolute in use**: A [`Timeout`] is what
//!   gets configured and saved; it becomes a [`Deadline`] when a wait starts
//!
//! ## Key Types
//!
//! - `Deadline`: Absolute point in time for timeout
//! - `Timeout`: Relative duration, serializable

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};

/// A point in time when an operation should timeout
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Deadline {
    instant: Instant,
}

impl Deadline {
    pub fn at(instant: Instant) -> Self {
        Self { instant }
    }

    /// A deadline `duration` from now
    pub fn after(duration: Duration) -> Self {
        Self::at(Instant::now() + duration)
    }

    pub fn instant(&self) -> Instant {
        self.instant
    }

    pub fn has_passed(&self, now: Instant) -> bool {
        now >= self.instant
    }

    /// Returns None if the deadline has passed
    pub fn time_remaining(&self, now: Instant) -> Option<Duration> {
        if now < self.instant {
            Some(self.instant.duration_since(now))
        } else {
            None
        }
    }
}

/// A duration-based timeout
///
/// Unlike Deadline, Timeout is relative and is converted to a Deadline
/// when the wait it bounds begins. It serializes as whole milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "u64", into = "u64")]
pub struct Timeout {
    duration: Duration,
}

impl Timeout {
    pub fn after(duration: Duration) -> Self {
        Self { duration }
    }

    pub fn from_millis(millis: u64) -> Self {
        Self::after(Duration::from_millis(millis))
    }

    pub fn from_secs(secs: u64) -> Self {
        Self::after(Duration::from_secs(secs))
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Whole milliseconds, saturating
    pub fn as_millis(&self) -> u64 {
        u64::try_from(self.duration.as_millis()).unwrap_or(u64::MAX)
    }

    pub fn to_deadline(&self, now: Instant) -> Deadline {
        Deadline::at(now + self.duration)
    }

    /// A deadline this long from now
    pub fn start(&self) -> Deadline {
        self.to_deadline(Instant::now())
    }
}

impl From<u64> for Timeout {
    fn from(millis: u64) -> Self {
        Self::from_millis(millis)
    }
}

impl From<Timeout> for u64 {
    fn from(timeout: Timeout) -> Self {
        timeout.as_millis()
    }
}

impl fmt::Display for Timeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.duration)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deadline_time_remaining() {
        let now = Instant::now();
        let deadline = Deadline::at(now + Duration::from_millis(100));
        assert!(!deadline.has_passed(now));
        assert_eq!(deadline.time_remaining(now), Some(Duration::from_millis(100)));
        let later = now + Duration::from_millis(200);
        assert!(deadline.has_passed(later));
        assert_eq!(deadline.time_remaining(later), None);
    }

    #[test]
    fn test_timeout_to_deadline() {
        let now = Instant::now();
        let timeout = Timeout::from_millis(100);
        assert_eq!(timeout.duration(), Duration::from_millis(100));
        let deadline = timeout.to_deadline(now);
        assert_eq!(deadline.instant(), now + Duration::from_millis(100));
        assert_eq!(Timeout::from_secs(5).duration(), Duration::from_secs(5));
    }

    #[test]
    fn test_timeout_millis_conversion() {
        let timeout = Timeout::after(Duration::from_micros(2500));
        assert_eq!(timeout.as_millis(), 2);
        assert_eq!(u64::from(Timeout::from_secs(3)), 3000);
        assert_eq!(Timeout::from(1500u64), Timeout::from_millis(1500));
        assert_eq!(Timeout::from_millis(250).to_string(), "250ms");
    }

    #[test]
    fn test_started_deadline_is_in_the_future() {
        let deadline = Timeout::from_secs(60).start();
        assert!(!deadline.has_passed(Instant::now()));
    }
}
