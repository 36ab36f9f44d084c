//! Running-task accounting and the CPU clock ticker
//!
//! The CPU clock advances once per [`CLOCK_TICK`] while at least one task is
//! running. Changes between nonzero counts are lock-free; the 0 to 1
//! transition takes the accounting lock so that it can wake the ticker,
//! which sleeps while nothing runs.

use crate::lock_order::{Level, Ordered};
use kernel_api::CLOCK_TICK;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::debug;

/// Called with the new CPU clock value after each tick
pub type TickCallback = Box<dyn Fn(u64) + Send + Sync>;

struct TickerState {
    /// False while the ticker sleeps waiting for a running task
    ticker_running: bool,
    next_tick: Instant,
    /// Asks the ticker to re-check its state before the next tick
    wake_pending: bool,
    shutdown: bool,
    thread: Option<JoinHandle<()>>,
}

pub struct RunningTasks {
    count: AtomicI64,
    cpu_clock: AtomicU64,
    state: Mutex<TickerState>,
    /// Signalled when tasks start running or the ticker must wake
    running_cond: Condvar,
    /// Signalled when the ticker goes to sleep
    stop_cond: Condvar,
    tick: Duration,
}

impl RunningTasks {
    pub fn new() -> Arc<Self> {
        Self::with_tick(CLOCK_TICK, 0)
    }

    pub(crate) fn with_tick(tick: Duration, cpu_clock: u64) -> Arc<Self> {
        Arc::new(Self {
            count: AtomicI64::new(0),
            cpu_clock: AtomicU64::new(cpu_clock),
            state: Mutex::new(TickerState {
                ticker_running: false,
                next_tick: Instant::now(),
                wake_pending: false,
                shutdown: false,
                thread: None,
            }),
            running_cond: Condvar::new(),
            stop_cond: Condvar::new(),
            tick,
        })
    }

    fn lock(&self) -> Ordered<MutexGuard<'_, TickerState>> {
        Ordered::acquire(Level::RunningTasks, || self.state.lock())
    }

    /// Number of tasks currently executing
    pub fn count(&self) -> i64 {
        self.count.load(Ordering::SeqCst)
    }

    /// Current CPU clock value in ticks
    pub fn cpu_clock(&self) -> u64 {
        self.cpu_clock.load(Ordering::SeqCst)
    }

    /// Accounts for a task starting to run
    pub fn inc(&self) {
        let mut current = self.count.load(Ordering::SeqCst);
        while current != 0 {
            match self.count.compare_exchange_weak(
                current,
                current + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }

        let mut state = self.lock();
        if self.count.load(Ordering::SeqCst) != 0 {
            // Another task raced us through the 0 to 1 transition.
            self.count.fetch_add(1, Ordering::SeqCst);
            return;
        }
        if !state.ticker_running {
            // Catch up on the tick missed while idle, then realign so the
            // next tick lands on the original cadence.
            let now = Instant::now();
            if now >= state.next_tick {
                let missed = now.duration_since(state.next_tick);
                let tick_ns = self.tick.as_nanos().max(1);
                let into_window = Duration::from_nanos(
                    u64::try_from(missed.as_nanos() % tick_ns).unwrap_or(0),
                );
                state.next_tick = now + (self.tick - into_window);
                self.cpu_clock.fetch_add(1, Ordering::SeqCst);
            }
            state.ticker_running = true;
            self.running_cond.notify_all();
        }
        self.count.store(1, Ordering::SeqCst);
    }

    /// Accounts for a task that stopped running
    ///
    /// # Panics
    ///
    /// Panics if the count would go negative.
    pub fn dec(&self) {
        let now = self.count.fetch_sub(1, Ordering::SeqCst) - 1;
        if now < 0 {
            panic!("Invalid running count {}", now);
        }
    }

    /// Starts the ticker thread; `on_tick` runs after every tick
    pub fn spawn_ticker(self: &Arc<Self>, on_tick: TickCallback) -> std::io::Result<()> {
        let mut state = self.lock();
        if state.thread.is_some() || state.shutdown {
            return Ok(());
        }
        let running = Arc::clone(self);
        let handle = thread::Builder::new()
            .name("cpu-clock-ticker".into())
            .spawn(move || running.ticker_loop(on_tick))?;
        state.thread = Some(handle);
        state.ticker_running = true;
        state.next_tick = Instant::now() + self.tick;
        Ok(())
    }

    fn ticker_loop(&self, on_tick: TickCallback) {
        let mut state = self.lock();
        loop {
            if state.shutdown {
                state.ticker_running = false;
                self.stop_cond.notify_all();
                return;
            }
            if self.count.load(Ordering::SeqCst) == 0 {
                state.ticker_running = false;
                state.wake_pending = false;
                self.stop_cond.notify_all();
                debug!(cpu_clock = self.cpu_clock(), "CPU clock ticker sleeping");
                while !state.ticker_running && !state.shutdown {
                    self.running_cond.wait(state.guard_mut());
                }
                debug!(cpu_clock = self.cpu_clock(), "CPU clock ticker awake");
                continue;
            }

            if state.wake_pending {
                state.wake_pending = false;
                continue;
            }
            let next_tick = state.next_tick;
            let now = Instant::now();
            if now < next_tick {
                self.running_cond.wait_until(state.guard_mut(), next_tick);
                continue;
            }
            // More than a tick late: drop the missed ticks instead of
            // replaying them back to back.
            state.next_tick = if now.duration_since(next_tick) >= self.tick {
                now + self.tick
            } else {
                next_tick + self.tick
            };
            let clock = self.cpu_clock.fetch_add(1, Ordering::SeqCst) + 1;
            drop(state);
            on_tick(clock);
            state = self.lock();
        }
    }

    /// Waits until the ticker is asleep
    ///
    /// The ticker is woken if it is between ticks and goes back to sleep
    /// once no task is running.
    pub fn pause_ticker(&self) {
        let mut state = self.lock();
        while state.ticker_running && state.thread.is_some() && !state.shutdown {
            state.wake_pending = true;
            self.running_cond.notify_all();
            self.stop_cond.wait(state.guard_mut());
        }
    }

    /// Stops the ticker thread for good
    pub fn shutdown(&self) {
        let handle = {
            let mut state = self.lock();
            state.shutdown = true;
            self.running_cond.notify_all();
            state.thread.take()
        };
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }

    pub fn is_ticker_running(&self) -> bool {
        self.lock().ticker_running
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_count_tracks_inc_and_dec() {
        let running = RunningTasks::new();
        running.inc();
        running.inc();
        assert_eq!(running.count(), 2);
        running.dec();
        running.dec();
        assert_eq!(running.count(), 0);
    }

    #[test]
    #[should_panic(expected = "Invalid running count")]
    fn test_negative_count_panics() {
        let running = RunningTasks::new();
        running.dec();
    }

    #[test]
    fn test_concurrent_transitions_never_go_negative() {
        let running = RunningTasks::new();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let running = Arc::clone(&running);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        running.inc();
                        assert!(running.count() > 0);
                        running.dec();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(running.count(), 0);
    }

    #[test]
    fn test_clock_advances_only_while_running() {
        let running = RunningTasks::with_tick(Duration::from_millis(1), 0);
        let ticks = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&ticks);
        running
            .spawn_ticker(Box::new(move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();

        running.inc();
        thread::sleep(Duration::from_millis(30));
        running.dec();
        running.pause_ticker();
        assert!(!running.is_ticker_running());
        let idle_clock = running.cpu_clock();
        assert!(idle_clock > 0);

        thread::sleep(Duration::from_millis(20));
        assert_eq!(running.cpu_clock(), idle_clock);
        assert!(ticks.load(Ordering::SeqCst) > 0);
        running.shutdown();
    }

    #[test]
    fn test_ticker_started_after_idle_does_not_burst() {
        let running = RunningTasks::with_tick(Duration::from_millis(1), 0);
        thread::sleep(Duration::from_millis(200));
        running.spawn_ticker(Box::new(|_| {})).unwrap();
        running.inc();
        thread::sleep(Duration::from_millis(10));
        running.dec();
        running.pause_ticker();
        let clock = running.cpu_clock();
        assert!(clock < 50, "clock jumped to {} after 10ms of running", clock);
        running.shutdown();
    }

    #[test]
    fn test_pause_ticker_without_thread_returns() {
        let running = RunningTasks::new();
        running.pause_ticker();
        running.shutdown();
    }
}
