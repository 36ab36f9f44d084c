//! Checkpoint and restore
//!
//! A checkpoint stream holds, in order:
//!
//! 1. the CPU feature set, so that restoring on an incompatible host fails
//!    before anything else is read;
//! 2. the kernel state record ([`snapshot::KernelSnapshot`]);
//! 3. the main memory file, then a record naming the owners of the private
//!    memory files, then each private memory file in that order.
//!
//! Memory files go to a separate pair of streams when one is supplied, in
//! which case they are written concurrently with the kernel state.
//!
//! [`Kernel::save_to`] requires a paused kernel. [`Kernel::checkpoint`]
//! wraps it with the pause, the save/restore helper and the bookkeeping a
//! control plane needs.

pub mod codec;
pub mod exec;
pub mod generation;
mod load;
mod save;
pub mod snapshot;

pub use load::{PagesInput, RestoreArgs};
pub use save::PagesOutput;

use crate::kernel::Kernel;
use core_types::WaitStatus;
use exec::ExecMode;
use kernel_api::{KernelError, MemorySaveOpts};
use std::io::Write;
use tracing::{info, warn};

/// Outcome of the last save, as reported to the control plane
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SaveStatus {
    #[default]
    Unset,
    Saved,
    AutoSaved,
    /// The save failed and the sandbox exits with this error
    Failed(KernelError),
}

/// Options for [`Kernel::checkpoint`]
#[derive(Debug, Clone, Copy, Default)]
pub struct CheckpointOptions {
    /// Keep running after the save instead of exiting
    pub resume: bool,
    /// The checkpoint was not requested by the user
    pub autosave: bool,
    pub mem_opts: MemorySaveOpts,
}

impl Kernel {
    /// Reports `(saved, autosaved, error)`
    pub fn save_status(&self) -> (bool, bool, Option<KernelError>) {
        let _extern = self.lock_external();
        match &self.inner().save_status {
            SaveStatus::Unset => (false, false, None),
            SaveStatus::Saved => (true, false, None),
            SaveStatus::AutoSaved => (true, true, None),
            SaveStatus::Failed(err) => (false, false, Some(err.clone())),
        }
    }

    /// Records a successful save unless a status is already set
    pub fn set_save_success(&self, autosave: bool) {
        let _extern = self.lock_external();
        let mut inner = self.inner();
        if inner.save_status == SaveStatus::Unset {
            inner.save_status = if autosave {
                SaveStatus::AutoSaved
            } else {
                SaveStatus::Saved
            };
        }
    }

    /// Records the error that ends the sandbox during a save unless a
    /// status is already set
    pub fn set_save_error(&self, err: KernelError) {
        let _extern = self.lock_external();
        let mut inner = self.inner();
        if inner.save_status == SaveStatus::Unset {
            inner.save_status = SaveStatus::Failed(err);
        }
    }

    /// Lets the filesystem prepare for tasks running again after a save
    pub fn before_resume(&self) {
        self.vfs.before_resume();
    }

    /// Pauses the kernel, saves it to `w` and then either resumes it or
    /// kills it
    ///
    /// The save/restore helper runs in save mode before the pause and, when
    /// resuming, in resume mode after it. A failed save is recorded with
    /// [`Kernel::set_save_error`] and the kernel is unpaused before the
    /// error is returned.
    pub fn checkpoint(
        &self,
        w: &mut (dyn Write + Send),
        pages: Option<PagesOutput<'_>>,
        opts: CheckpointOptions,
    ) -> Result<(), KernelError> {
        self.run_save_restore_exec(ExecMode::Save)?;

        self.pause();
        if let Err(err) = self.save_to(w, pages, &opts.mem_opts) {
            warn!(%err, "checkpoint failed");
            self.set_save_error(err.clone());
            self.unpause();
            return Err(err);
        }

        if opts.resume {
            self.before_resume();
            self.unpause();
            self.run_save_restore_exec(ExecMode::Resume)?;
            let generation = self.checkpoint_generation().increment();
            info!(generation, "checkpoint complete, resumed");
        } else {
            self.set_save_success(opts.autosave);
            let generation = self.checkpoint_generation().increment();
            self.kill(WaitStatus::exited(0));
            self.unpause();
            info!(generation, "checkpoint complete, exiting");
        }
        Ok(())
    }

    /// Completes a restore once the restored kernel has started
    pub fn finish_restore(&self) -> Result<(), KernelError> {
        self.run_save_restore_exec(ExecMode::Restore)?;
        let generation = self.checkpoint_generation().increment();
        info!(generation, "restore complete");
        Ok(())
    }
}
