//! Host time sources

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Period of the kernel CPU clock (Linux HZ = 100)
pub const CLOCK_TICK: Duration = Duration::from_millis(10);

/// Host clocks, in nanoseconds
pub trait Clocks: Send + Sync {
    /// Nanoseconds since the Unix epoch
    fn realtime_now(&self) -> i64;

    /// Nanoseconds since an arbitrary fixed point
    fn monotonic_now(&self) -> i64;
}

/// [`Clocks`] backed by the host's system clocks
#[derive(Debug, Clone)]
pub struct HostClocks {
    start: Instant,
}

impl HostClocks {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for HostClocks {
    fn default() -> Self {
        Self::new()
    }
}

impl Clocks for HostClocks {
    fn realtime_now(&self) -> i64 {
        match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(d) => i64::try_from(d.as_nanos()).unwrap_or(i64::MAX),
            Err(_) => 0,
        }
    }

    fn monotonic_now(&self) -> i64 {
        i64::try_from(self.start.elapsed().as_nanos()).unwrap_or(i64::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_tick_is_ten_millis() {
        assert_eq!(CLOCK_TICK.as_millis(), 10);
    }

    #[test]
    fn test_host_monotonic_never_goes_back() {
        let clocks = HostClocks::new();
        let a = clocks.monotonic_now();
        let b = clocks.monotonic_now();
        assert!(b >= a);
        assert!(clocks.realtime_now() > 0);
    }
}
