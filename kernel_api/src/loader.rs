//! Executable loading contract

use crate::cpuid::FeatureSet;
use crate::memory::MemoryManager;
use crate::platform::ArchState;
use crate::vfs::{FileDescription, VirtualDentry};
use core_types::Errno;
use identity::FileCapabilities;
use std::sync::Arc;
use thiserror::Error;

/// Arguments to [`Loader::load_task_image`]
#[derive(Debug, Clone)]
pub struct LoadArgs {
    pub root: VirtualDentry,
    pub working_dir: VirtualDentry,
    /// Path of the executable, resolved relative to `working_dir`
    pub filename: String,
    /// An already open executable; takes precedence over `filename`
    pub file: Option<Arc<dyn FileDescription>>,
    pub argv: Vec<String>,
    pub envv: Vec<String>,
    pub max_symlink_traversals: u32,
    pub features: FeatureSet,
}

/// A loaded program ready to run in a task
#[derive(Debug, Clone)]
pub struct TaskImage {
    /// Short name of the executable, as in /proc/[pid]/comm
    pub name: String,
    pub arch: ArchState,
    pub memory_manager: Arc<dyn MemoryManager>,
    pub file_caps: Option<FileCapabilities>,
}

/// A structured load failure
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("failed to load {filename}: {errno}")]
pub struct LoadError {
    pub filename: String,
    pub errno: Errno,
}

impl LoadError {
    pub fn new(filename: impl Into<String>, errno: Errno) -> Self {
        Self {
            filename: filename.into(),
            errno,
        }
    }
}

/// Builds task images
///
/// Implementations must not mutate shared kernel state when loading fails.
pub trait Loader: Send + Sync {
    fn load_task_image(&self, args: &LoadArgs) -> Result<TaskImage, LoadError>;

    /// Rebuilds the memory manager `id` once memory files have been restored
    fn restore_memory_manager(&self, id: u64) -> Result<Arc<dyn MemoryManager>, LoadError>;
}
