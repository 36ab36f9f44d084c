//! Sandbox time
//!
//! The timekeeper turns host clocks into the clocks seen by applications.
//! Monotonic time is frozen while updates are paused, so an application
//! never observes the time a sandbox spent checkpointed.

use kernel_api::{Clocks, KernelError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimekeeperSnapshot {
    /// Application monotonic time when the snapshot was taken
    pub monotonic_ns: i64,
}

struct TimekeeperState {
    clocks: Option<Arc<dyn Clocks>>,
    /// Added to host monotonic time
    monotonic_offset: i64,
    /// Application monotonic time at which updates were paused
    paused_at: Option<i64>,
}

pub struct Timekeeper {
    state: Mutex<TimekeeperState>,
}

impl Timekeeper {
    /// Creates a timekeeper; clocks must be set before the kernel is
    /// initialized
    pub fn new(clocks: Option<Arc<dyn Clocks>>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(TimekeeperState {
                clocks,
                monotonic_offset: 0,
                paused_at: None,
            }),
        })
    }

    /// Rebuilds a paused timekeeper that resumes from the saved time
    pub fn from_snapshot(snapshot: &TimekeeperSnapshot, clocks: Arc<dyn Clocks>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(TimekeeperState {
                clocks: Some(clocks),
                monotonic_offset: 0,
                paused_at: Some(snapshot.monotonic_ns),
            }),
        })
    }

    pub fn set_clocks(&self, clocks: Arc<dyn Clocks>) {
        self.state.lock().clocks = Some(clocks);
    }

    pub fn has_clocks(&self) -> bool {
        self.state.lock().clocks.is_some()
    }

    /// Application monotonic time in nanoseconds
    pub fn monotonic_now(&self) -> Result<i64, KernelError> {
        let state = self.state.lock();
        Self::monotonic_locked(&state)
    }

    /// Wall-clock time in nanoseconds since the epoch
    pub fn realtime_now(&self) -> Result<i64, KernelError> {
        let state = self.state.lock();
        match &state.clocks {
            Some(clocks) => Ok(clocks.realtime_now()),
            None => Err(no_clocks()),
        }
    }

    fn monotonic_locked(state: &TimekeeperState) -> Result<i64, KernelError> {
        if let Some(paused) = state.paused_at {
            return Ok(paused);
        }
        match &state.clocks {
            Some(clocks) => Ok(clocks.monotonic_now().saturating_add(state.monotonic_offset)),
            None => Err(no_clocks()),
        }
    }

    /// Freezes application time; idempotent
    pub fn pause_updates(&self) {
        let mut state = self.state.lock();
        if state.paused_at.is_some() {
            return;
        }
        if let Ok(now) = Self::monotonic_locked(&state) {
            state.paused_at = Some(now);
        }
    }

    /// Lets application time flow again from where it was frozen
    pub fn resume_updates(&self) {
        let mut state = self.state.lock();
        let Some(paused) = state.paused_at else {
            return;
        };
        if let Some(clocks) = &state.clocks {
            state.monotonic_offset = paused.saturating_sub(clocks.monotonic_now());
            state.paused_at = None;
        }
    }

    pub fn is_paused(&self) -> bool {
        self.state.lock().paused_at.is_some()
    }

    pub fn snapshot(&self) -> Result<TimekeeperSnapshot, KernelError> {
        Ok(TimekeeperSnapshot {
            monotonic_ns: self.monotonic_now()?,
        })
    }

    /// Drops the host clocks
    pub fn destroy(&self) {
        let mut state = self.state.lock();
        state.clocks = None;
        state.paused_at = None;
    }
}

impl fmt::Debug for Timekeeper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Timekeeper")
            .field("has_clocks", &state.clocks.is_some())
            .field("paused_at", &state.paused_at)
            .finish()
    }
}

fn no_clocks() -> KernelError {
    KernelError::InvalidConfig("timekeeper has no clocks".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::ManualClocks;

    #[test]
    fn test_monotonic_frozen_while_paused() {
        let clocks = ManualClocks::new(1_000);
        let tk = Timekeeper::new(Some(clocks.clone()));
        assert_eq!(tk.monotonic_now().unwrap(), 1_000);

        tk.pause_updates();
        clocks.advance(500);
        assert_eq!(tk.monotonic_now().unwrap(), 1_000);

        tk.resume_updates();
        assert_eq!(tk.monotonic_now().unwrap(), 1_000);
        clocks.advance(20);
        assert_eq!(tk.monotonic_now().unwrap(), 1_020);
    }

    #[test]
    fn test_restore_continues_from_saved_time() {
        let snapshot = TimekeeperSnapshot {
            monotonic_ns: 5_000,
        };
        let clocks = ManualClocks::new(10);
        let tk = Timekeeper::from_snapshot(&snapshot, clocks.clone());
        assert!(tk.is_paused());
        tk.resume_updates();
        clocks.advance(7);
        assert_eq!(tk.monotonic_now().unwrap(), 5_007);
    }

    #[test]
    fn test_missing_clocks() {
        let tk = Timekeeper::new(None);
        assert!(!tk.has_clocks());
        assert!(tk.monotonic_now().is_err());
    }
}
