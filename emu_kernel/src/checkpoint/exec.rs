//! The save/restore helper binary
//!
//! When configured, a helper process is run inside the sandbox around each
//! checkpoint. It sees [`MODE_ENV`] set to the phase it is called for and
//! must exit with status 0 within the configured timeout.

use crate::kernel::{CreateProcessArgs, Kernel};
use crate::task::Task;
use core_types::{Signal, WaitStatus};
use kernel_api::{CheckpointStage, KernelError};
use lifecycle::Timeout;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// Environment variable telling the helper which phase it runs in
pub const MODE_ENV: &str = "SANDBOX_SAVE_RESTORE_EXEC_MODE";

/// Phase the helper is run for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecMode {
    /// Before the kernel is saved
    Save,
    /// After a restored kernel has started
    Restore,
    /// After a saved kernel resumes running
    Resume,
}

impl ExecMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecMode::Save => "save",
            ExecMode::Restore => "restore",
            ExecMode::Resume => "resume",
        }
    }
}

impl fmt::Display for ExecMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How to run the helper
#[derive(Clone)]
pub struct SaveRestoreExecConfig {
    /// `argv[0]` is the absolute path of the helper
    pub argv: Vec<String>,
    pub timeout: Timeout,
    /// Task whose credentials, namespaces and container the helper runs
    /// with; global init's leader when absent
    pub leader: Option<Arc<Task>>,
}

impl SaveRestoreExecConfig {
    pub fn new(argv: Vec<String>, timeout: Timeout) -> Self {
        Self {
            argv,
            timeout,
            leader: None,
        }
    }

    pub fn with_leader(mut self, leader: Arc<Task>) -> Self {
        self.leader = Some(leader);
        self
    }
}

impl fmt::Debug for SaveRestoreExecConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SaveRestoreExecConfig")
            .field("argv", &self.argv)
            .field("timeout", &self.timeout)
            .field("leader", &self.leader.as_ref().map(|t| t.key()))
            .finish()
    }
}

fn exec_error(cause: impl fmt::Display) -> KernelError {
    KernelError::checkpoint(CheckpointStage::SaveRestoreExec, cause)
}

impl Kernel {
    /// Runs the helper in `mode`, if one is configured
    ///
    /// The external lock must not be held: process creation takes it.
    pub fn run_save_restore_exec(&self, mode: ExecMode) -> Result<(), KernelError> {
        let Some(config) = self.save_restore_exec_config() else {
            return Ok(());
        };
        if config.argv.is_empty() {
            return Err(exec_error("helper argv is empty"));
        }
        let leader = match &config.leader {
            Some(leader) => Arc::clone(leader),
            None => self
                .global_init()
                .and_then(|init| init.leader())
                .ok_or_else(|| exec_error("no leader task to run the helper under"))?,
        };

        let started = Instant::now();
        let mut args = CreateProcessArgs::new(config.argv.clone(), leader.credentials())
            .with_envv(vec![format!("{}={}", MODE_ENV, mode)])
            .with_pid_namespace(Arc::clone(leader.thread_group().pid_namespace()))
            .with_container_id(leader.container_id())
            .with_limits(leader.thread_group().limits().copy());
        if let Some(mntns) = leader.mount_namespace() {
            args = args.with_mount_namespace(mntns);
        }
        let (tg, tgid) = self.create_process(args).map_err(exec_error)?;
        self.start_process(&tg).map_err(exec_error)?;
        info!(%mode, %tgid, "save/restore helper started");

        match tg.wait_exited_until(config.timeout.start()) {
            Some(status) if status == WaitStatus::exited(0) => {
                info!(%mode, elapsed = ?started.elapsed(), "save/restore helper finished");
                Ok(())
            }
            Some(status) => {
                warn!(%mode, %status, "save/restore helper failed");
                Err(exec_error(format!("helper exited with {}", status)))
            }
            None => {
                warn!(%mode, timeout = %config.timeout, "save/restore helper timed out");
                tg.group_exit(WaitStatus::signaled(Signal::SIGKILL));
                Err(exec_error(format!(
                    "helper did not exit within {}",
                    config.timeout
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_names() {
        assert_eq!(ExecMode::Save.to_string(), "save");
        assert_eq!(ExecMode::Restore.to_string(), "restore");
        assert_eq!(ExecMode::Resume.to_string(), "resume");
    }

    #[test]
    fn test_config_debug_omits_task_details() {
        let config = SaveRestoreExecConfig::new(vec!["/helper".into()], Timeout::from_secs(1));
        let text = format!("{:?}", config);
        assert!(text.contains("/helper"));
        assert!(text.contains("leader: None"));
    }
}
