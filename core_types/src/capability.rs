//! Linux capabilities
//!
//! Capabilities split the privileges of the superuser into distinct units
//! that can be independently granted. A [`CapabilitySet`] is a bitmask
//! indexed by [`Capability`] number.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A single capability
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Capability(pub u32);

impl Capability {
    pub const CHOWN: Capability = Capability(0);
    pub const DAC_OVERRIDE: Capability = Capability(1);
    pub const DAC_READ_SEARCH: Capability = Capability(2);
    pub const FOWNER: Capability = Capability(3);
    pub const FSETID: Capability = Capability(4);
    pub const KILL: Capability = Capability(5);
    pub const SETGID: Capability = Capability(6);
    pub const SETUID: Capability = Capability(7);
    pub const SETPCAP: Capability = Capability(8);
    pub const NET_BIND_SERVICE: Capability = Capability(10);
    pub const NET_ADMIN: Capability = Capability(12);
    pub const NET_RAW: Capability = Capability(13);
    pub const SYS_CHROOT: Capability = Capability(18);
    pub const SYS_PTRACE: Capability = Capability(19);
    pub const SYS_ADMIN: Capability = Capability(21);
    pub const SYS_NICE: Capability = Capability(23);
    pub const SYS_RESOURCE: Capability = Capability(24);
    pub const SYS_TIME: Capability = Capability(25);

    /// Highest valid capability number
    pub const LAST: Capability = Capability(40);

    pub fn is_valid(&self) -> bool {
        self.0 <= Self::LAST.0
    }

    fn bit(&self) -> u64 {
        1u64 << self.0
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match *self {
            Capability::CHOWN => "CAP_CHOWN",
            Capability::DAC_OVERRIDE => "CAP_DAC_OVERRIDE",
            Capability::KILL => "CAP_KILL",
            Capability::SETGID => "CAP_SETGID",
            Capability::SETUID => "CAP_SETUID",
            Capability::NET_ADMIN => "CAP_NET_ADMIN",
            Capability::SYS_PTRACE => "CAP_SYS_PTRACE",
            Capability::SYS_ADMIN => "CAP_SYS_ADMIN",
            Capability::SYS_RESOURCE => "CAP_SYS_RESOURCE",
            other => return write!(f, "CAP_{}", other.0),
        };
        f.write_str(name)
    }
}

/// A set of capabilities
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct CapabilitySet(pub u64);

impl CapabilitySet {
    /// The empty set
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Every valid capability
    pub const fn all() -> Self {
        Self((1u64 << (Capability::LAST.0 + 1)) - 1)
    }

    /// Builds a set from a list of capabilities
    pub fn of(caps: &[Capability]) -> Self {
        let mut set = Self::empty();
        for cap in caps {
            set.add(*cap);
        }
        set
    }

    pub fn contains(&self, cap: Capability) -> bool {
        cap.is_valid() && self.0 & cap.bit() != 0
    }

    pub fn add(&mut self, cap: Capability) {
        if cap.is_valid() {
            self.0 |= cap.bit();
        }
    }

    pub fn remove(&mut self, cap: Capability) {
        self.0 &= !cap.bit();
    }

    pub fn union(&self, other: CapabilitySet) -> CapabilitySet {
        CapabilitySet(self.0 | other.0)
    }

    pub fn intersection(&self, other: CapabilitySet) -> CapabilitySet {
        CapabilitySet(self.0 & other.0)
    }

    /// Returns true if every capability in `self` is also in `other`
    pub fn is_subset_of(&self, other: CapabilitySet) -> bool {
        self.0 & !other.0 == 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}
