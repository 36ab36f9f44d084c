//! # Kernel API
//!
//! This crate defines the boundary between the task-execution core and the
//! services it consumes.
//!
//! ## Philosophy
//!
//! The core orchestrates **when** tasks run and **what** happens at the edges
//! of their execution. Everything else is a collaborator:
//! - Executable loading ([`Loader`])
//! - Path resolution and filesystem save/restore hooks ([`VirtualFilesystem`])
//! - Page storage ([`MemoryFile`], [`MemoryManager`])
//! - Networking ([`NetworkStack`])
//! - Instruction execution ([`Platform`])
//!
//! ## Design Goals
//!
//! 1. **Testability**: Every collaborator is a trait and can be faked
//! 2. **Explicitness**: Collaborators are handed to the kernel, never looked up
//! 3. **Narrow contracts**: Each trait exposes only what the core calls
//!
//! ## Non-Goals
//!
//! This is NOT:
//! - A syscall interface
//! - A filesystem, network stack or page allocator

pub mod cpuid;
pub mod error;
pub mod loader;
pub mod memory;
pub mod net;
pub mod platform;
pub mod time;
pub mod vfs;

pub use cpuid::FeatureSet;
pub use error::{CheckpointStage, KernelError};
pub use loader::{LoadArgs, LoadError, Loader, TaskImage};
pub use memory::{AsyncMemoryFileLoader, MemoryFile, MemoryManager, MemorySaveOpts};
pub use net::NetworkStack;
pub use platform::{AppContext, AppEvent, ArchState, Platform};
pub use time::{Clocks, HostClocks, CLOCK_TICK};
pub use vfs::{
    CompleteRestoreOptions, FileDescription, MountNamespace, SpecialFilesystem,
    VirtualDentry, VirtualFilesystem,
};
