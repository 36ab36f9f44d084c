//! Memory file and address space contracts

use core_types::Errno;
use std::fmt;
use std::io::{self, Read, Write};
use std::sync::Arc;

/// Options for [`MemoryFile::save_to`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemorySaveOpts {
    /// Skip pages that are committed but known to be zero
    pub exclude_committed_zero_pages: bool,
}

/// A pool of pages backing application memory
pub trait MemoryFile: Send + Sync {
    /// Begins evicting reclaimable allocations
    fn start_evictions(&self);

    fn wait_for_evictions(&self);

    /// Marks the file as part of the upcoming checkpoint
    fn mark_savable(&self);

    /// Writes the file's metadata to `metadata` and its pages to `pages`, or
    /// to `metadata` as well when `pages` is absent
    fn save_to(
        &self,
        metadata: &mut dyn Write,
        pages: Option<&mut dyn Write>,
        opts: &MemorySaveOpts,
    ) -> io::Result<()>;

    /// Mirrors [`MemoryFile::save_to`]
    fn load_from(&self, metadata: &mut dyn Read, pages: Option<&mut dyn Read>) -> io::Result<()>;

    fn destroy(&self);
}

/// The address space of one or more tasks
pub trait MemoryManager: Send + Sync + fmt::Debug {
    /// Stable identity used to find the address space after restore
    fn id(&self) -> u64;

    /// Drops mappings that cannot be checkpointed, such as host file
    /// mappings
    fn invalidate_unsavable(&self) -> Result<(), Errno>;

    /// Creates a copy-on-write duplicate, as for fork(2)
    fn fork(&self) -> Result<Arc<dyn MemoryManager>, Errno>;
}

/// A memory file whose pages are loaded in the background after restore
pub trait AsyncMemoryFileLoader: Send + Sync {
    /// Blocks until the main memory file can accept writes
    fn wait_main_start(&self) -> io::Result<()>;
}
