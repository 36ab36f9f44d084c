//! Interval timers
//!
//! [`IntervalTimer`] is a wall-clock timer with its own worker thread that
//! invokes a listener on expiry. [`CpuTimer`] counts CPU clock ticks and is
//! advanced by the kernel's CPU clock ticker.
//!
//! Pausing is idempotent and freezes the remaining time, so a timer that
//! is paused for a checkpoint resumes with exactly the time it had left.

use crate::lock_order::{Level, Ordered};
use kernel_api::CLOCK_TICK;
use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::warn;

/// Called with the number of expirations since the last call
pub type TimerListener = Box<dyn Fn(u64) + Send + Sync>;

/// Value and reload interval of a timer, as in `struct itimerval`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerSetting {
    /// Time until the next expiry; zero means disarmed
    pub value: Duration,
    /// Reload value after each expiry; zero means one-shot
    pub interval: Duration,
}

impl TimerSetting {
    pub fn new(value: Duration, interval: Duration) -> Self {
        Self { value, interval }
    }

    pub fn disarmed() -> Self {
        Self::default()
    }

    pub fn is_armed(&self) -> bool {
        !self.value.is_zero()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerValue {
    Disarmed,
    Deadline(Instant),
    Remaining(Duration),
}

struct TimerState {
    value: TimerValue,
    interval: Duration,
    paused: bool,
    destroyed: bool,
    worker_started: bool,
}

struct TimerShared {
    state: Mutex<TimerState>,
    cond: Condvar,
    listener: TimerListener,
    name: String,
}

impl TimerShared {
    fn lock(&self) -> Ordered<MutexGuard<'_, TimerState>> {
        Ordered::acquire(Level::TimerInternal, || self.state.lock())
    }

    fn run(self: Arc<Self>) {
        let mut state = self.lock();
        loop {
            if state.destroyed {
                return;
            }
            let deadline = match (state.paused, state.value) {
                (false, TimerValue::Deadline(deadline)) => deadline,
                _ => {
                    self.cond.wait(state.guard_mut());
                    continue;
                }
            };
            let now = Instant::now();
            if now < deadline {
                self.cond.wait_until(state.guard_mut(), deadline);
                continue;
            }
            let mut expirations = 1u64;
            if state.interval.is_zero() {
                state.value = TimerValue::Disarmed;
            } else {
                let late = now.duration_since(deadline);
                let periods = late.as_nanos() / state.interval.as_nanos();
                expirations += u64::try_from(periods).unwrap_or(u64::MAX - 1);
                let advance = state
                    .interval
                    .saturating_mul(u32::try_from(periods + 1).unwrap_or(u32::MAX));
                state.value = TimerValue::Deadline(deadline + advance);
            }
            drop(state);
            (self.listener)(expirations);
            state = self.lock();
        }
    }
}

/// A timer measured against the host monotonic clock
pub struct IntervalTimer {
    shared: Arc<TimerShared>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntervalTimerSnapshot {
    /// Nanoseconds left, if armed
    pub remaining_ns: Option<u64>,
    pub interval_ns: u64,
}

impl IntervalTimer {
    pub fn new(name: impl Into<String>, listener: TimerListener) -> Self {
        Self {
            shared: Arc::new(TimerShared {
                state: Mutex::new(TimerState {
                    value: TimerValue::Disarmed,
                    interval: Duration::ZERO,
                    paused: false,
                    destroyed: false,
                    worker_started: false,
                }),
                cond: Condvar::new(),
                listener,
                name: name.into(),
            }),
        }
    }

    /// Rebuilds a paused timer
    pub fn from_snapshot(
        name: impl Into<String>,
        snapshot: &IntervalTimerSnapshot,
        listener: TimerListener,
    ) -> Self {
        let timer = Self::new(name, listener);
        {
            let mut state = timer.shared.lock();
            state.paused = true;
            state.interval = Duration::from_nanos(snapshot.interval_ns);
            state.value = match snapshot.remaining_ns {
                Some(ns) => TimerValue::Remaining(Duration::from_nanos(ns)),
                None => TimerValue::Disarmed,
            };
        }
        timer
    }

    fn remaining(value: TimerValue, now: Instant) -> Duration {
        match value {
            TimerValue::Disarmed => Duration::ZERO,
            TimerValue::Deadline(deadline) => deadline.saturating_duration_since(now),
            TimerValue::Remaining(remaining) => remaining,
        }
    }

    /// Returns the current setting
    pub fn get(&self) -> TimerSetting {
        let state = self.shared.lock();
        TimerSetting {
            value: Self::remaining(state.value, Instant::now()),
            interval: state.interval,
        }
    }

    /// Arms or disarms the timer, returning the previous setting
    pub fn set(&self, setting: TimerSetting) -> TimerSetting {
        let mut state = self.shared.lock();
        let now = Instant::now();
        let old = TimerSetting {
            value: Self::remaining(state.value, now),
            interval: state.interval,
        };
        state.interval = setting.interval;
        state.value = if !setting.is_armed() {
            TimerValue::Disarmed
        } else if state.paused {
            TimerValue::Remaining(setting.value)
        } else {
            TimerValue::Deadline(now + setting.value)
        };
        if setting.is_armed() {
            self.ensure_worker(&mut state);
        }
        self.shared.cond.notify_all();
        old
    }

    /// Starts the expiry thread the first time the timer is armed
    fn ensure_worker(&self, state: &mut TimerState) {
        if state.worker_started || state.destroyed {
            return;
        }
        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name(format!("timer-{}", self.shared.name))
            .spawn(move || shared.run());
        match spawned {
            Ok(_) => state.worker_started = true,
            Err(err) => warn!(timer = %self.shared.name, %err, "failed to start timer thread"),
        }
    }

    /// Stops the timer from expiring; idempotent
    pub fn pause(&self) {
        let mut state = self.shared.lock();
        if state.paused {
            return;
        }
        state.paused = true;
        if let TimerValue::Deadline(deadline) = state.value {
            state.value = TimerValue::Remaining(deadline.saturating_duration_since(Instant::now()));
        }
        self.shared.cond.notify_all();
    }

    /// Undoes [`IntervalTimer::pause`]; idempotent
    pub fn resume(&self) {
        let mut state = self.shared.lock();
        if !state.paused {
            return;
        }
        state.paused = false;
        if let TimerValue::Remaining(remaining) = state.value {
            state.value = TimerValue::Deadline(Instant::now() + remaining);
            // A restored timer has no worker yet.
            self.ensure_worker(&mut state);
        }
        self.shared.cond.notify_all();
    }

    pub fn is_paused(&self) -> bool {
        self.shared.lock().paused
    }

    /// Disarms the timer and stops its worker thread
    pub fn destroy(&self) {
        let mut state = self.shared.lock();
        state.destroyed = true;
        state.value = TimerValue::Disarmed;
        self.shared.cond.notify_all();
    }

    pub fn snapshot(&self) -> IntervalTimerSnapshot {
        let state = self.shared.lock();
        let remaining_ns = match state.value {
            TimerValue::Disarmed => None,
            value => Some(
                u64::try_from(Self::remaining(value, Instant::now()).as_nanos())
                    .unwrap_or(u64::MAX),
            ),
        };
        IntervalTimerSnapshot {
            remaining_ns,
            interval_ns: u64::try_from(state.interval.as_nanos()).unwrap_or(u64::MAX),
        }
    }
}

impl Drop for IntervalTimer {
    fn drop(&mut self) {
        // May run under any lock; not order-checked.
        let mut state = self.shared.state.lock();
        state.destroyed = true;
        state.value = TimerValue::Disarmed;
        self.shared.cond.notify_all();
    }
}

impl fmt::Debug for IntervalTimer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.lock();
        f.debug_struct("IntervalTimer")
            .field("name", &self.shared.name)
            .field("value", &state.value)
            .field("paused", &state.paused)
            .finish()
    }
}

/// A timer counting CPU clock ticks (ITIMER_VIRTUAL, ITIMER_PROF)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuTimer {
    /// Ticks until expiry; zero means disarmed
    pub value: u64,
    pub interval: u64,
}

impl CpuTimer {
    pub fn from_setting(setting: TimerSetting) -> Self {
        Self {
            value: duration_to_ticks(setting.value),
            interval: duration_to_ticks(setting.interval),
        }
    }

    pub fn setting(&self) -> TimerSetting {
        TimerSetting {
            value: ticks_to_duration(self.value),
            interval: ticks_to_duration(self.interval),
        }
    }

    pub fn is_armed(&self) -> bool {
        self.value != 0
    }

    /// Consumes `ticks`, returning the number of expirations
    pub fn advance(&mut self, ticks: u64) -> u64 {
        if self.value == 0 || ticks == 0 {
            return 0;
        }
        if ticks < self.value {
            self.value -= ticks;
            return 0;
        }
        let over = ticks - self.value;
        if self.interval == 0 {
            self.value = 0;
            return 1;
        }
        self.value = self.interval - over % self.interval;
        1 + over / self.interval
    }
}

/// Rounds up to whole ticks
pub fn duration_to_ticks(d: Duration) -> u64 {
    let tick = CLOCK_TICK.as_nanos();
    u64::try_from(d.as_nanos().div_ceil(tick)).unwrap_or(u64::MAX)
}

pub fn ticks_to_duration(ticks: u64) -> Duration {
    CLOCK_TICK.saturating_mul(u32::try_from(ticks).unwrap_or(u32::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn counting_timer() -> (IntervalTimer, Arc<AtomicU64>) {
        let count = Arc::new(AtomicU64::new(0));
        let c = Arc::clone(&count);
        let timer = IntervalTimer::new(
            "test",
            Box::new(move |n| {
                c.fetch_add(n, Ordering::SeqCst);
            }),
        );
        (timer, count)
    }

    fn wait_for(count: &AtomicU64, at_least: u64) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if count.load(Ordering::SeqCst) >= at_least {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        false
    }

    #[test]
    fn test_one_shot_fires_once() {
        let (timer, count) = counting_timer();
        timer.set(TimerSetting::new(Duration::from_millis(5), Duration::ZERO));
        assert!(wait_for(&count, 1));
        thread::sleep(Duration::from_millis(20));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!timer.get().is_armed());
    }

    #[test]
    fn test_periodic_timer() {
        let (timer, count) = counting_timer();
        timer.set(TimerSetting::new(Duration::from_millis(2), Duration::from_millis(2)));
        assert!(wait_for(&count, 3));
        timer.destroy();
    }

    #[test]
    fn test_paused_timer_keeps_remaining_time() {
        let (timer, count) = counting_timer();
        timer.set(TimerSetting::new(Duration::from_secs(60), Duration::ZERO));
        timer.pause();
        timer.pause();
        let first = timer.snapshot();
        thread::sleep(Duration::from_millis(5));
        assert_eq!(timer.snapshot(), first);
        assert!(first.remaining_ns.is_some());
        timer.resume();
        assert!(!timer.is_paused());
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_paused_timer_does_not_fire() {
        let (timer, count) = counting_timer();
        timer.pause();
        timer.set(TimerSetting::new(Duration::from_millis(1), Duration::ZERO));
        thread::sleep(Duration::from_millis(20));
        assert_eq!(count.load(Ordering::SeqCst), 0);
        timer.resume();
        assert!(wait_for(&count, 1));
    }

    #[test]
    fn test_restored_timer_is_paused() {
        let snap = IntervalTimerSnapshot {
            remaining_ns: Some(1_000),
            interval_ns: 0,
        };
        let timer = IntervalTimer::from_snapshot("restored", &snap, Box::new(|_| {}));
        assert!(timer.is_paused());
        assert_eq!(timer.snapshot(), snap);
    }

    #[test]
    fn test_cpu_timer_expirations() {
        let mut timer = CpuTimer {
            value: 3,
            interval: 2,
        };
        assert_eq!(timer.advance(2), 0);
        assert_eq!(timer.advance(1), 1);
        assert_eq!(timer.value, 2);
        assert_eq!(timer.advance(5), 2);
        assert_eq!(timer.value, 1);

        let mut one_shot = CpuTimer {
            value: 1,
            interval: 0,
        };
        assert_eq!(one_shot.advance(4), 1);
        assert!(!one_shot.is_armed());
        assert_eq!(one_shot.advance(4), 0);
    }

    #[test]
    fn test_tick_conversion_rounds_up() {
        assert_eq!(duration_to_ticks(Duration::from_millis(1)), 1);
        assert_eq!(duration_to_ticks(Duration::from_millis(20)), 2);
        assert_eq!(ticks_to_duration(3), Duration::from_millis(30));
    }
}
