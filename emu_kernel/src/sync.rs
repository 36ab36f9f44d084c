//! Blocking synchronization helpers

use parking_lot::{Condvar, Mutex};

/// Counts outstanding work and lets callers wait for it to drain
#[derive(Debug, Default)]
pub struct WaitGroup {
    count: Mutex<i64>,
    cond: Condvar,
}

impl WaitGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adjusts the counter by `delta`
    ///
    /// # Panics
    ///
    /// Panics if the counter becomes negative.
    pub fn add(&self, delta: i64) {
        let mut count = self.count.lock();
        *count += delta;
        if *count < 0 {
            panic!("negative WaitGroup counter: {}", *count);
        }
        if *count == 0 {
            self.cond.notify_all();
        }
    }

    pub fn done(&self) {
        self.add(-1);
    }

    /// Blocks until the counter is zero
    pub fn wait(&self) {
        let mut count = self.count.lock();
        while *count != 0 {
            self.cond.wait(&mut count);
        }
    }

    pub fn count(&self) -> i64 {
        *self.count.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_wait_returns_when_drained() {
        let wg = Arc::new(WaitGroup::new());
        wg.add(2);
        let workers: Vec<_> = (0..2)
            .map(|_| {
                let wg = Arc::clone(&wg);
                thread::spawn(move || {
                    thread::sleep(Duration::from_millis(5));
                    wg.done();
                })
            })
            .collect();
        wg.wait();
        assert_eq!(wg.count(), 0);
        for w in workers {
            w.join().unwrap();
        }
    }

    #[test]
    fn test_wait_on_empty_group() {
        WaitGroup::new().wait();
    }

    #[test]
    #[should_panic(expected = "negative WaitGroup counter")]
    fn test_negative_counter_panics() {
        WaitGroup::new().done();
    }
}
