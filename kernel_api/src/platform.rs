//! Execution backend contract

use crate::cpuid::FeatureSet;
use crate::memory::MemoryManager;
use core_types::{Errno, SigAction, SignalInfo, TaskKey, ThreadId};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Architectural register state of a task
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchState {
    pub registers: Vec<u64>,
    pub instruction_pointer: u64,
    pub stack_pointer: u64,
    /// Thread-local storage base
    pub tls: u64,
}

/// Why control returned from application code
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppEvent {
    /// The application trapped into the kernel and can continue
    Continue,
    /// The task must sleep, optionally with a timeout
    Block(Option<Duration>),
    /// Execution was cut short by [`Platform::interrupt`]
    Interrupted,
    /// The task called exit(2)
    ExitThread(i32),
    /// The task called exit_group(2)
    ExitGroup(i32),
    /// The application raised a synchronous signal
    Signal(SignalInfo),
}

/// State handed to the platform for one trip into application code
pub struct AppContext<'a> {
    pub task: TaskKey,
    pub tid: ThreadId,
    pub arch: &'a mut ArchState,
    pub memory_manager: &'a dyn MemoryManager,
}

/// Executes application instructions on behalf of tasks
///
/// Each call to [`Platform::switch_to_app`] is made from the task's own
/// thread, so implementations must tolerate concurrent calls for distinct
/// tasks.
pub trait Platform: Send + Sync {
    /// Features the host CPU offers
    fn host_feature_set(&self) -> FeatureSet;

    /// Highest CPU number the host may ever bring online
    fn max_possible_cpu(&self) -> Result<u32, Errno>;

    /// Runs application code until it needs kernel attention
    fn switch_to_app(&self, ctx: AppContext<'_>) -> AppEvent;

    /// Forces a task currently in [`Platform::switch_to_app`] to return
    fn interrupt(&self, task: TaskKey);

    /// Redirects a task to a user signal handler
    fn deliver_signal(
        &self,
        task: TaskKey,
        arch: &mut ArchState,
        info: &SignalInfo,
        action: &SigAction,
    ) -> Result<(), Errno>;
}
