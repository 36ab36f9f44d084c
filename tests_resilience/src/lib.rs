//! Resilience Test Utilities
//!
//! Shared setup for the kernel's end-to-end tests: kernels wired to the
//! scripted fakes from `emu_kernel::test_utils`, and polling helpers for
//! state that task threads change asynchronously.
//!
//! ## Test Philosophy
//!
//! - **Real threads**: every task runs on its own host thread, as in production
//! - **Deterministic failures**: collaborator faults come from a FaultPlan
//! - **Nothing leaks past kill**: every test ends with the kernel killed and drained
//! - **Checkpoints are exact**: a restored kernel has the IDs, signals and memory it was saved with

use emu_kernel::test_utils::{process_args, Fakes};
use emu_kernel::{Kernel, ThreadGroup};
use core_types::{ThreadId, WaitStatus};
use kernel_api::KernelError;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::debug;

/// How long [`eventually`] waits before giving up
pub const SETTLE_TIMEOUT: Duration = Duration::from_secs(10);

/// Bootstrap helper for tests
///
/// Creates fakes and a kernel with two application cores that has not
/// been started.
pub fn boot() -> (Fakes, Arc<Kernel>) {
    let fakes = Fakes::new();
    let kernel = fakes.kernel().expect("kernel init failed");
    (fakes, kernel)
}

/// Creates and starts a process running `argv`
pub fn spawn_process(
    kernel: &Kernel,
    argv: &[&str],
) -> Result<(Arc<ThreadGroup>, ThreadId), KernelError> {
    let (tg, tgid) = kernel.create_process(process_args(kernel, argv))?;
    kernel.start_process(&tg)?;
    debug!(%tgid, "test process started");
    Ok((tg, tgid))
}

/// Polls `cond` until it holds or [`SETTLE_TIMEOUT`] passes
pub fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + SETTLE_TIMEOUT;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}

/// Kills every task and waits for the kernel to drain
pub fn shutdown(kernel: &Kernel) {
    kernel.kill(WaitStatus::exited(0));
    kernel.wait_exited();
}
