//! # Core Types
//!
//! This crate defines the fundamental value types shared by the kernel
//! crates.
//!
//! ## Philosophy
//!
//! - **Plain values**: Everything here is `Copy` or cheaply cloned and
//!   serializable, so it can cross crate boundaries and checkpoints.
//! - **Linux numbering**: Signals, capabilities and error numbers use the
//!   values applications expect.
//!
//! ## Key Types
//!
//! - [`ThreadId`]: A namespace-relative thread ID
//! - [`TaskKey`]: A kernel-wide task identity
//! - [`Kuid`] / [`Kgid`]: Root-namespace user and group IDs
//! - [`CapabilitySet`]: A set of Linux capabilities
//! - [`Signal`], [`SignalSet`], [`SignalInfo`]: Signal values
//! - [`Errno`]: Application-visible failures

pub mod capability;
pub mod errno;
pub mod ids;
pub mod signal;

pub use capability::{Capability, CapabilitySet};
pub use errno::Errno;
pub use ids::{CgroupId, FileId, HierarchyId, Kgid, Kuid, TaskKey, ThreadId};
pub use signal::{
    code, sa_flags, DefaultAction, SigAction, SigHandler, Signal, SignalInfo, SignalSet,
    WaitStatus,
};
