//! Signals injected from outside the sandbox

use super::Kernel;
use crate::session::ProcessGroup;
use crate::thread_group::ThreadGroup;
use core_types::{Errno, Signal, SignalInfo};
use kernel_api::KernelError;
use tracing::{debug, info};

impl Kernel {
    /// Delivers `info` to global init
    ///
    /// SIGURG is dropped: hosts use it to preempt threads and it is never
    /// meant for the sandbox. `context` describes where the signal came
    /// from, for logging only.
    pub fn send_external_signal(&self, info: SignalInfo, context: &str) -> Result<(), KernelError> {
        let _extern = self.lock_external();
        if info.signal() == Signal::SIGURG {
            debug!(context, "dropping external SIGURG");
            return Ok(());
        }
        info!(signo = info.signo, context, "received external signal");
        let init = self
            .global_init()
            .ok_or(KernelError::Errno(Errno::ESRCH))?;
        init.send_signal(info)?;
        Ok(())
    }

    /// Delivers `info` to `tg`; unlike [`Kernel::send_external_signal`]
    /// nothing is dropped
    pub fn send_external_signal_thread_group(
        &self,
        tg: &ThreadGroup,
        info: SignalInfo,
    ) -> Result<(), Errno> {
        let _extern = self.lock_external();
        tg.send_signal(info)
    }

    /// Delivers `info` to every thread group in `pg`
    ///
    /// Every member is attempted; the first failure is returned.
    pub fn send_external_signal_process_group(
        &self,
        pg: &ProcessGroup,
        info: SignalInfo,
    ) -> Result<(), Errno> {
        let _extern = self.lock_external();
        let mut first_err = None;
        for tg in self.task_set().thread_groups() {
            if tg.process_group().map(|p| p.id()) != Some(pg.id()) {
                continue;
            }
            if let Err(errno) = tg.send_signal(info) {
                debug!(tg = tg.uid(), %errno, "process group member did not take signal");
                first_err.get_or_insert(errno);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Delivers `info` to every thread group whose leader belongs to
    /// container `cid`
    ///
    /// Every member is attempted. Unlike
    /// [`send_external_signal_process_group`](Self::send_external_signal_process_group),
    /// which reports the first failure, this deliberately reports the last.
    pub fn send_container_signal(&self, cid: &str, info: SignalInfo) -> Result<(), Errno> {
        let _extern = self.lock_external();
        let state = self.task_set().read();
        let mut last_err = None;
        for tg in state.thread_groups.values() {
            let in_container = tg.leader().is_some_and(|leader| leader.container_id() == cid);
            if !in_container {
                continue;
            }
            let mut sig = tg.signals.lock();
            if let Err(errno) = tg.signals.send_locked(&mut sig, None, info) {
                last_err = Some(errno);
            }
        }
        last_err.map_or(Ok(()), Err)
    }
}
