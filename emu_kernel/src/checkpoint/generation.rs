//! Checkpoint generation counter

use lifecycle::Deadline;
use parking_lot::{Condvar, Mutex};

/// Counts completed checkpoints and restores
///
/// Waiters block until the count reaches a target generation.
#[derive(Debug, Default)]
pub struct CheckpointGeneration {
    count: Mutex<u32>,
    cond: Condvar,
}

impl CheckpointGeneration {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> u32 {
        *self.count.lock()
    }

    /// Records one more completed checkpoint or restore and wakes waiters
    pub fn increment(&self) -> u32 {
        let mut count = self.count.lock();
        *count = count.wrapping_add(1);
        self.cond.notify_all();
        *count
    }

    /// Blocks until at least `generation` checkpoints have completed
    pub fn wait_for_generation(&self, generation: u32) {
        let mut count = self.count.lock();
        while *count < generation {
            self.cond.wait(&mut count);
        }
    }

    /// Like [`CheckpointGeneration::wait_for_generation`], giving up at
    /// `deadline`; returns whether the generation was reached
    pub fn wait_for_generation_until(&self, generation: u32, deadline: Deadline) -> bool {
        let mut count = self.count.lock();
        while *count < generation {
            if self.cond.wait_until(&mut count, deadline.instant()).timed_out() {
                break;
            }
        }
        *count >= generation
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_starts_at_zero() {
        let gen = CheckpointGeneration::new();
        assert_eq!(gen.get(), 0);
        gen.wait_for_generation(0);
    }

    #[test]
    fn test_waiter_wakes_on_increment() {
        let gen = Arc::new(CheckpointGeneration::new());
        let waiter = {
            let gen = Arc::clone(&gen);
            thread::spawn(move || gen.wait_for_generation(2))
        };
        gen.increment();
        gen.increment();
        waiter.join().unwrap();
        assert_eq!(gen.get(), 2);
    }

    #[test]
    fn test_wait_until_times_out() {
        let gen = CheckpointGeneration::new();
        let reached = gen.wait_for_generation_until(1, Deadline::after(Duration::from_millis(10)));
        assert!(!reached);
    }
}
