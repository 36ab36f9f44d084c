//! Virtual filesystem contract

use crate::error::KernelError;
use crate::memory::MemoryFile;
use core_types::{Errno, FileId};
use identity::Credentials;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// A reference to a path within a mount
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VirtualDentry {
    pub mount: u64,
    pub path: String,
}

impl VirtualDentry {
    pub fn new(mount: u64, path: impl Into<String>) -> Self {
        Self {
            mount,
            path: path.into(),
        }
    }
}

impl fmt::Display for VirtualDentry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.mount, self.path)
    }
}

/// The mount table view of a set of tasks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountNamespace {
    pub id: u64,
    pub root: VirtualDentry,
}

/// Kernel-internal filesystems mounted at Init
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SpecialFilesystem {
    Pipe,
    Nsfs,
    Shm,
    Sockets,
}

impl SpecialFilesystem {
    pub const ALL: [SpecialFilesystem; 4] = [
        SpecialFilesystem::Pipe,
        SpecialFilesystem::Nsfs,
        SpecialFilesystem::Shm,
        SpecialFilesystem::Sockets,
    ];
}

/// Filesystem checks performed when restoring
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompleteRestoreOptions {
    pub validate_file_sizes: bool,
    pub validate_mtimes: bool,
}

/// An open file
pub trait FileDescription: Send + Sync + fmt::Debug {
    /// Stable identity used to find the file again after restore
    fn id(&self) -> FileId;

    /// Path shown to applications, e.g. in /proc/[pid]/maps
    fn mapped_name(&self) -> String;

    fn is_socket(&self) -> bool {
        false
    }

    fn is_readable(&self) -> bool {
        true
    }

    /// Stops a timer owned by the file, if any; must be idempotent
    fn pause_timer(&self) {}

    fn resume_timer(&self) {}
}

/// The filesystem services used by the task core
pub trait VirtualFilesystem: Send + Sync {
    fn init(&self) -> Result<(), KernelError>;

    /// Creates an internal mount that is not attached to any namespace
    fn new_disconnected_mount(&self, fs: SpecialFilesystem) -> Result<VirtualDentry, KernelError>;

    /// Resolves `path` starting at `start`, never escaping `root`
    fn get_dentry_at(
        &self,
        creds: &Credentials,
        root: &VirtualDentry,
        start: &VirtualDentry,
        path: &str,
    ) -> Result<VirtualDentry, Errno>;

    /// Prepares filesystems for saving and registers any memory files they
    /// own, keyed by a stable owner name
    fn prepare_save(
        &self,
        private_memory_files: &mut BTreeMap<String, Arc<dyn MemoryFile>>,
    ) -> Result<(), KernelError>;

    fn complete_restore(&self, opts: &CompleteRestoreOptions) -> Result<(), KernelError>;

    /// Called before execution resumes after a save
    fn before_resume(&self);

    /// Reopens a file that was open when the checkpoint was taken
    fn restore_file(&self, id: FileId) -> Result<Arc<dyn FileDescription>, KernelError>;

    fn release(&self);
}
