//! Identifiers for kernel entities

use serde::{Deserialize, Serialize};
use std::fmt;

/// A thread ID as seen from a particular PID namespace
///
/// The same task has a different `ThreadId` in every namespace it is
/// visible from. Thread group IDs, process group IDs and session IDs share
/// the same numbering space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ThreadId(pub i32);

impl ThreadId {
    /// The ID of the init process of a PID namespace
    pub const INIT: ThreadId = ThreadId(1);

    /// Exclusive upper bound on allocated thread IDs
    pub const LIMIT: i32 = 1 << 22;

    /// Returns the raw value
    pub fn as_raw(&self) -> i32 {
        self.0
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A user ID in the root user namespace
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Kuid(pub u32);

impl Kuid {
    /// The root user
    pub const ROOT: Kuid = Kuid(0);

    /// Returned for IDs that have no mapping
    pub const NO_ID: Kuid = Kuid(u32::MAX);

    pub fn ok(&self) -> bool {
        *self != Self::NO_ID
    }
}

impl fmt::Display for Kuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "kuid:{}", self.0)
    }
}

/// A group ID in the root user namespace
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Kgid(pub u32);

impl Kgid {
    /// The root group
    pub const ROOT: Kgid = Kgid(0);

    /// Returned for IDs that have no mapping
    pub const NO_ID: Kgid = Kgid(u32::MAX);

    pub fn ok(&self) -> bool {
        *self != Self::NO_ID
    }
}

impl fmt::Display for Kgid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "kgid:{}", self.0)
    }
}

/// Kernel-wide key of a task
///
/// Unlike [`ThreadId`], a `TaskKey` does not depend on the observer's PID
/// namespace and is never reused while the kernel is alive. It is the
/// identity the platform uses to refer to a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TaskKey(pub u64);

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Task({})", self.0)
    }
}

/// Identifier of a cgroup within the cgroup registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CgroupId(pub u32);

impl fmt::Display for CgroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cgroup:{}", self.0)
    }
}

/// Identifier of a cgroup hierarchy
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct HierarchyId(pub u32);

impl fmt::Display for HierarchyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "hierarchy:{}", self.0)
    }
}

/// Identifier of an open file description, assigned by the filesystem
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FileId(pub u64);

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "File({})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thread_id_display() {
        assert_eq!(ThreadId(42).to_string(), "42");
        assert_eq!(ThreadId::INIT.as_raw(), 1);
    }

    #[test]
    fn test_kuid_ok() {
        assert!(Kuid::ROOT.ok());
        assert!(Kuid(1000).ok());
        assert!(!Kuid::NO_ID.ok());
        assert!(!Kgid::NO_ID.ok());
    }

    #[test]
    fn test_ids_order() {
        assert!(TaskKey(1) < TaskKey(2));
        assert!(CgroupId(3) > CgroupId(1));
    }

    #[test]
    fn test_serialization() {
        let key = TaskKey(7);
        let json = serde_json::to_string(&key).unwrap();
        let back: TaskKey = serde_json::from_str(&json).unwrap();
        assert_eq!(key, back);
    }
}
