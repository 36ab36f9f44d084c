//! Per-task scheduling state and CPU time accounting

use super::Task;
use serde::{Deserialize, Serialize};

/// What a task's thread is doing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GoroutineState {
    /// The thread has not started or has finished
    Nonexistent,
    /// Executing kernel code
    RunningSys,
    /// Executing application code
    RunningApp,
    /// Waiting for an event
    Blocked,
    /// Held by a group stop or an external stop
    Stopped,
}

impl GoroutineState {
    /// Reports whether the state counts as running for CPU clock purposes
    pub fn is_running(self) -> bool {
        matches!(self, GoroutineState::RunningSys | GoroutineState::RunningApp)
    }
}

/// Accumulated CPU time, in CPU clock ticks
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuStats {
    pub user_ticks: u64,
    pub sys_ticks: u64,
}

impl CpuStats {
    pub fn add(self, other: CpuStats) -> CpuStats {
        CpuStats {
            user_ticks: self.user_ticks + other.user_ticks,
            sys_ticks: self.sys_ticks + other.sys_ticks,
        }
    }

    pub fn total(&self) -> u64 {
        self.user_ticks + self.sys_ticks
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct SchedInfo {
    pub(crate) state: GoroutineState,
    /// CPU clock value at the last transition
    pub(crate) timestamp: u64,
    pub(crate) stats: CpuStats,
}

impl SchedInfo {
    pub(crate) fn new(stats: CpuStats) -> Self {
        Self {
            state: GoroutineState::Nonexistent,
            timestamp: 0,
            stats,
        }
    }
}

impl Task {
    /// Moves the task's thread to `state`, charging elapsed ticks to the
    /// state it leaves and updating running-task accounting
    pub(crate) fn set_goroutine_state(&self, state: GoroutineState) {
        let (was_running, now_running) = {
            let mut sched = self.sched.lock();
            let old = sched.state;
            if old == state {
                return;
            }
            let now = self.running.cpu_clock();
            let elapsed = now.saturating_sub(sched.timestamp);
            match old {
                GoroutineState::RunningApp => sched.stats.user_ticks += elapsed,
                GoroutineState::RunningSys => sched.stats.sys_ticks += elapsed,
                _ => {}
            }
            sched.timestamp = now;
            sched.state = state;
            (old.is_running(), state.is_running())
        };
        match (was_running, now_running) {
            (false, true) => self.running.inc(),
            (true, false) => self.running.dec(),
            _ => {}
        }
    }

    pub fn goroutine_state(&self) -> GoroutineState {
        self.sched.lock().state
    }

    /// CPU time consumed so far, including the current stretch
    pub fn cpu_stats(&self) -> CpuStats {
        let sched = self.sched.lock();
        let mut stats = sched.stats;
        let elapsed = self.running.cpu_clock().saturating_sub(sched.timestamp);
        match sched.state {
            GoroutineState::RunningApp => stats.user_ticks += elapsed,
            GoroutineState::RunningSys => stats.sys_ticks += elapsed,
            _ => {}
        }
        stats
    }

    /// The running state the task is in, if any; sampled by the ticker to
    /// charge interval timers
    pub(crate) fn sample_tick(&self) -> Option<GoroutineState> {
        let state = self.sched.lock().state;
        state.is_running().then_some(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_running_states() {
        assert!(GoroutineState::RunningApp.is_running());
        assert!(GoroutineState::RunningSys.is_running());
        assert!(!GoroutineState::Blocked.is_running());
        assert!(!GoroutineState::Stopped.is_running());
        assert!(!GoroutineState::Nonexistent.is_running());
    }

    #[test]
    fn test_cpu_stats_add() {
        let a = CpuStats {
            user_ticks: 2,
            sys_ticks: 3,
        };
        let b = CpuStats {
            user_ticks: 5,
            sys_ticks: 1,
        };
        assert_eq!(a.add(b).total(), 11);
    }
}
