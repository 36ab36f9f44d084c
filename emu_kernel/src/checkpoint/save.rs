//! Writing a checkpoint

use super::codec::{write_record, RecordKind};
use crate::kernel::Kernel;
use kernel_api::{CheckpointStage, KernelError, MemoryFile, MemorySaveOpts, NetworkStack};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::io::Write;
use std::sync::Arc;
use std::thread;
use std::time::Instant;
use tracing::{debug, info};

/// Separate destination for memory file contents
///
/// When given, memory files are saved on their own thread while the kernel
/// state is written to the main stream.
pub struct PagesOutput<'a> {
    pub metadata: &'a mut (dyn Write + Send),
    pub pages: &'a mut (dyn Write + Send),
}

fn memory_error(cause: impl fmt::Display) -> KernelError {
    KernelError::checkpoint(CheckpointStage::MemoryFiles, cause)
}

/// Resumes time when dropped
struct TimePaused<'a>(&'a Kernel);

impl Drop for TimePaused<'_> {
    fn drop(&mut self) {
        self.0.resume_time();
    }
}

/// Resumes the network stack when dropped
struct NetworkPaused(Option<Arc<dyn NetworkStack>>);

impl Drop for NetworkPaused {
    fn drop(&mut self) {
        if let Some(stack) = &self.0 {
            stack.resume();
        }
    }
}

/// Saves the main memory file, the owner record and the private memory
/// files, in that order
fn save_memory_files(
    main: &dyn MemoryFile,
    private: &BTreeMap<String, Arc<dyn MemoryFile>>,
    metadata: &mut dyn Write,
    mut pages: Option<&mut dyn Write>,
    opts: &MemorySaveOpts,
) -> Result<(), KernelError> {
    let started = Instant::now();
    main.save_to(metadata, pages.as_mut().map(|p| &mut **p as &mut dyn Write), opts)
        .map_err(memory_error)?;
    let owners: Vec<&String> = private.keys().collect();
    write_record(metadata, RecordKind::PrivateMemoryFiles, &owners).map_err(memory_error)?;
    for (owner, mf) in private {
        mf.save_to(metadata, pages.as_mut().map(|p| &mut **p as &mut dyn Write), opts)
            .map_err(|err| memory_error(format!("private memory file {}: {}", owner, err)))?;
    }
    info!(elapsed = ?started.elapsed(), "Memory files save took");
    Ok(())
}

impl Kernel {
    /// Writes a checkpoint of the kernel to `w`
    ///
    /// The kernel must be paused. Memory files are written to `pages` when
    /// given, else to `w` after the kernel state. Time stops for the
    /// duration of the call.
    pub fn save_to(
        &self,
        w: &mut (dyn Write + Send),
        pages: Option<PagesOutput<'_>>,
        opts: &MemorySaveOpts,
    ) -> Result<(), KernelError> {
        let started = Instant::now();
        let _extern = self.lock_external();

        self.pause_time();
        let _time = TimePaused(self);

        self.memory_file.start_evictions();
        self.memory_file.wait_for_evictions();

        self.invalidate_unsavable_mappings()?;

        // After invalidation: dropping mappings may change filesystem state.
        let mut private: BTreeMap<String, Arc<dyn MemoryFile>> = BTreeMap::new();
        self.vfs
            .prepare_save(&mut private)
            .map_err(|err| KernelError::checkpoint(CheckpointStage::Filesystem, err))?;
        self.memory_file.mark_savable();
        for mf in private.values() {
            mf.mark_savable();
        }

        let main: &dyn MemoryFile = &*self.memory_file;
        let private = &private;
        thread::scope(|scope| {
            let parallel = pages.map(move |p| {
                scope.spawn(move || {
                    save_memory_files(main, private, p.metadata, Some(p.pages as &mut dyn Write), opts)
                })
            });

            let state = self.save_kernel_records(&mut *w);

            let memory = match parallel {
                Some(handle) => handle
                    .join()
                    .unwrap_or_else(|_| Err(memory_error("memory file save thread panicked"))),
                None if state.is_ok() => save_memory_files(main, private, &mut *w, None, opts),
                None => Ok(()),
            };
            state.and(memory)
        })?;

        info!(elapsed = ?started.elapsed(), "Overall save took");
        Ok(())
    }

    /// Writes the CPU feature set and kernel state records
    fn save_kernel_records(&self, w: &mut dyn Write) -> Result<(), KernelError> {
        let started = Instant::now();
        write_record(&mut *w, RecordKind::CpuFeatures, self.feature_set())
            .map_err(|err| KernelError::checkpoint(CheckpointStage::CpuFeatures, err))?;
        info!(elapsed = ?started.elapsed(), "CPUID save took");

        let _net = self.pause_network();

        let started = Instant::now();
        let snapshot = self.capture_state()?;
        write_record(w, RecordKind::KernelState, &snapshot)
            .map_err(|err| KernelError::checkpoint(CheckpointStage::KernelState, err))?;
        info!(
            elapsed = ?started.elapsed(),
            tasks = snapshot.tasks.len(),
            thread_groups = snapshot.thread_groups.len(),
            "Kernel save took"
        );
        Ok(())
    }

    fn pause_network(&self) -> NetworkPaused {
        let stack = self.root_network_namespace().stack();
        if let Some(stack) = &stack {
            let started = Instant::now();
            stack.pause();
            debug!(elapsed = ?started.elapsed(), "paused root network namespace");
        }
        NetworkPaused(stack)
    }

    /// Drops mappings that cannot be saved from every address space,
    /// including images waiting at an exec boundary
    fn invalidate_unsavable_mappings(&self) -> Result<(), KernelError> {
        let mut invalidated = BTreeSet::new();
        for task in self.task_set().tasks() {
            for image in task.images() {
                let mm = &image.memory_manager;
                if !invalidated.insert(mm.id()) {
                    continue;
                }
                mm.invalidate_unsavable().map_err(|errno| {
                    memory_error(format!("failed to invalidate unsavable mappings: {}", errno))
                })?;
            }
        }
        debug!(address_spaces = invalidated.len(), "invalidated unsavable mappings");
        Ok(())
    }
}
