//! The pause protocol and time pausing around checkpoints

use super::Kernel;
use tracing::{debug, info};

impl Kernel {
    /// Stops every task and waits until task threads and asynchronous I/O
    /// are quiescent
    ///
    /// Pauses nest; each needs a matching [`Kernel::unpause`].
    pub fn pause(&self) {
        {
            let _extern = self.lock_external();
            self.task_set().begin_external_stop();
        }
        self.task_set().running_goroutines.wait();
        self.task_set().aio_goroutines.wait();
        info!("kernel paused");
    }

    /// Undoes one [`Kernel::pause`]; tasks resume after the last one
    ///
    /// # Panics
    ///
    /// Panics if the kernel is not paused.
    pub fn unpause(&self) {
        let _extern = self.lock_external();
        self.task_set().end_external_stop();
        info!("kernel unpaused");
    }

    pub fn is_paused(&self) -> bool {
        self.task_set().read().external_stop_count > 0
    }

    /// Stops the CPU clock ticker, interval timers, file timers and
    /// timekeeper updates
    ///
    /// Task threads must be stopped and the external lock held.
    pub(crate) fn pause_time(&self) {
        self.running_tasks().pause_ticker();
        for tg in self.task_set().thread_groups() {
            tg.itimer_real.pause();
        }
        for task in self.task_set().tasks() {
            if let Some(fds) = task.fd_table() {
                for file in fds.files() {
                    file.pause_timer();
                }
            }
        }
        self.timekeeper().pause_updates();
        debug!(cpu_clock = self.cpu_clock(), "time paused");
    }

    /// Mirrors [`Kernel::pause_time`]; the ticker wakes on its own when a
    /// task next runs
    pub(crate) fn resume_time(&self) {
        self.timekeeper().resume_updates();
        for tg in self.task_set().thread_groups() {
            tg.itimer_real.resume();
        }
        for task in self.task_set().tasks() {
            if let Some(fds) = task.fd_table() {
                for file in fds.files() {
                    file.resume_timer();
                }
            }
        }
        debug!("time resumed");
    }
}
