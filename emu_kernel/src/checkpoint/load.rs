//! Restoring a kernel from a checkpoint

use super::codec::{read_record, RecordKind};
use super::snapshot::{self, KernelSnapshot};
use crate::kernel::{Kernel, KernelDeps};
use kernel_api::{
    AsyncMemoryFileLoader, CheckpointStage, Clocks, CompleteRestoreOptions, FeatureSet,
    KernelError, MemoryFile, NetworkStack,
};
use std::collections::BTreeMap;
use std::fmt;
use std::io::Read;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// Separate sources for memory file contents, mirroring
/// [`super::PagesOutput`]
pub struct PagesInput<'a> {
    pub metadata: &'a mut dyn Read,
    pub pages: &'a mut dyn Read,
}

/// Host-side state a restored kernel is attached to
pub struct RestoreArgs {
    /// Cores available on this host; only checked when the checkpoint
    /// exposed host core numbers
    pub application_cores: u32,
    pub clocks: Arc<dyn Clocks>,
    /// Stack serving the root network namespace
    pub network_stack: Option<Arc<dyn NetworkStack>>,
    /// The network stack's own state was saved with the checkpoint and
    /// `network_stack` is its host side
    pub save_restore_net: bool,
    /// Host configuration adopted by a restored stack
    pub network_config: Option<Arc<dyn NetworkStack>>,
    /// Loads the main memory file in the background instead of from the
    /// checkpoint stream
    pub async_loader: Option<Arc<dyn AsyncMemoryFileLoader>>,
    /// Private memory files keyed by owner, as registered by the
    /// filesystem at save time
    pub private_memory_files: BTreeMap<String, Arc<dyn MemoryFile>>,
    pub vfs_opts: CompleteRestoreOptions,
}

impl RestoreArgs {
    pub fn new(application_cores: u32, clocks: Arc<dyn Clocks>) -> Self {
        Self {
            application_cores,
            clocks,
            network_stack: None,
            save_restore_net: false,
            network_config: None,
            async_loader: None,
            private_memory_files: BTreeMap::new(),
            vfs_opts: CompleteRestoreOptions::default(),
        }
    }

    pub fn with_network_stack(mut self, stack: Arc<dyn NetworkStack>) -> Self {
        self.network_stack = Some(stack);
        self
    }

    /// Marks `stack` as the host side of a stack saved in the checkpoint
    pub fn with_saved_network(mut self, stack: Arc<dyn NetworkStack>) -> Self {
        self.network_stack = Some(stack);
        self.save_restore_net = true;
        self
    }

    pub fn with_network_config(mut self, config: Arc<dyn NetworkStack>) -> Self {
        self.network_config = Some(config);
        self
    }

    pub fn with_async_loader(mut self, loader: Arc<dyn AsyncMemoryFileLoader>) -> Self {
        self.async_loader = Some(loader);
        self
    }

    pub fn with_private_memory_file(
        mut self,
        owner: impl Into<String>,
        mf: Arc<dyn MemoryFile>,
    ) -> Self {
        self.private_memory_files.insert(owner.into(), mf);
        self
    }

    pub fn with_vfs_opts(mut self, opts: CompleteRestoreOptions) -> Self {
        self.vfs_opts = opts;
        self
    }
}

fn memory_error(cause: impl fmt::Display) -> KernelError {
    KernelError::checkpoint(CheckpointStage::MemoryFiles, cause)
}

/// Reads the main memory file, the owner record and the private memory
/// files written by the save path
fn load_memory_files(
    main: &dyn MemoryFile,
    private: &BTreeMap<String, Arc<dyn MemoryFile>>,
    metadata: &mut dyn Read,
    mut pages: Option<&mut dyn Read>,
) -> Result<(), KernelError> {
    main.load_from(metadata, pages.as_mut().map(|p| &mut **p as &mut dyn Read))
        .map_err(memory_error)?;
    let owners: Vec<String> =
        read_record(metadata, RecordKind::PrivateMemoryFiles).map_err(memory_error)?;
    for owner in &owners {
        let mf = private
            .get(owner)
            .ok_or_else(|| memory_error(format!("no private memory file for owner {:?}", owner)))?;
        mf.load_from(metadata, pages.as_mut().map(|p| &mut **p as &mut dyn Read))
            .map_err(|err| memory_error(format!("private memory file {}: {}", owner, err)))?;
    }
    debug!(private = owners.len(), "memory files loaded");
    Ok(())
}

impl Kernel {
    /// Builds a kernel from a checkpoint written by [`Kernel::save_to`]
    ///
    /// The CPU feature record is checked against the host before anything
    /// else is read. The returned kernel is paused until
    /// [`Kernel::start`].
    pub fn load_from(
        deps: KernelDeps,
        r: &mut dyn Read,
        pages: Option<PagesInput<'_>>,
        args: RestoreArgs,
    ) -> Result<Arc<Kernel>, KernelError> {
        let overall = Instant::now();

        let started = Instant::now();
        let saved: FeatureSet = read_record(&mut *r, RecordKind::CpuFeatures)
            .map_err(|err| KernelError::checkpoint(CheckpointStage::CpuFeatures, err))?;
        saved.check_host_compatible(&deps.platform.host_feature_set())?;
        info!(elapsed = ?started.elapsed(), "CPUID load took");

        let started = Instant::now();
        let snap: KernelSnapshot = read_record(&mut *r, RecordKind::KernelState)
            .map_err(|err| KernelError::checkpoint(CheckpointStage::KernelState, err))?;
        if snap.use_host_cores && args.application_cores > snap.application_cores {
            return Err(KernelError::HostIncompatible(format!(
                "UseHostCores enabled: can't increase application cores from {} to {} after restore",
                snap.application_cores, args.application_cores
            )));
        }
        let parts = snapshot::rebuild(&snap, deps, Arc::clone(&args.clocks))?;
        info!(
            elapsed = ?started.elapsed(),
            tasks = snap.tasks.len(),
            thread_groups = snap.thread_groups.len(),
            "Kernel load took"
        );

        let started = Instant::now();
        match &args.async_loader {
            Some(loader) => loader.wait_main_start().map_err(memory_error)?,
            None => {
                let main = &*parts.deps.memory_file;
                match pages {
                    Some(p) => load_memory_files(
                        main,
                        &args.private_memory_files,
                        p.metadata,
                        Some(p.pages),
                    )?,
                    None => load_memory_files(main, &args.private_memory_files, &mut *r, None)?,
                }
            }
        }
        info!(elapsed = ?started.elapsed(), "Memory files load took");

        if let Some(stack) = &args.network_stack {
            parts.root_net_ns.restore_stack(Arc::clone(stack));
            if args.save_restore_net {
                if let Some(config) = &args.network_config {
                    stack.replace_config(Arc::clone(config));
                }
            }
            stack.restore();
        } else if args.save_restore_net {
            return Err(KernelError::checkpoint(
                CheckpointStage::Network,
                "saved network state needs a stack to restore into",
            ));
        }

        parts.deps.vfs.complete_restore(&args.vfs_opts)?;

        let kernel = Kernel::assemble(parts);
        info!(elapsed = ?overall.elapsed(), "Overall load took");
        Ok(kernel)
    }
}
