//! # Resources
//!
//! Resource limits and CPU time accounting units.
//!
//! ## Philosophy
//!
//! - **Limits are per thread group**: Every thread group owns a [`LimitSet`]
//!   that is shared by its tasks and copied on fork.
//! - **Soft and hard values**: A [`Limit`] carries the current (soft) value
//!   enforced by the kernel and the maximum (hard) value the soft value may
//!   be raised to.
//! - **Accounting is coarse**: CPU time is measured in [`CpuTicks`] of the
//!   kernel's CPU clock, not in nanoseconds.
//!
//! ## Non-Goals
//!
//! This is NOT:
//! - Enforcement of every limit (callers consult the limits they own)
//! - A cgroup controller

use core_types::Errno;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Ticks of the kernel CPU clock
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct CpuTicks(pub u64);

impl CpuTicks {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn zero() -> Self {
        Self(0)
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn checked_add(&self, other: Self) -> Option<Self> {
        self.0.checked_add(other.0).map(Self)
    }

    pub fn checked_sub(&self, other: Self) -> Option<Self> {
        self.0.checked_sub(other.0).map(Self)
    }

    pub fn saturating_add(&self, other: Self) -> Self {
        Self(self.0.saturating_add(other.0))
    }

    pub fn saturating_sub(&self, other: Self) -> Self {
        Self(self.0.saturating_sub(other.0))
    }
}

impl fmt::Display for CpuTicks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} CPU ticks", self.0)
    }
}

/// A limited resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum LimitKind {
    Cpu,
    FileSize,
    Data,
    Stack,
    Core,
    Rss,
    /// Number of tasks a user may own (RLIMIT_NPROC)
    ProcessCount,
    /// One more than the highest file descriptor number (RLIMIT_NOFILE)
    NumberOfFiles,
    MemoryLocked,
    AddressSpace,
    Locks,
    SignalsPending,
    MessageQueueBytes,
    Nice,
    RealTimePriority,
    Rttime,
}

impl LimitKind {
    /// Every limit, in rlimit resource order
    pub const ALL: [LimitKind; 16] = [
        LimitKind::Cpu,
        LimitKind::FileSize,
        LimitKind::Data,
        LimitKind::Stack,
        LimitKind::Core,
        LimitKind::Rss,
        LimitKind::ProcessCount,
        LimitKind::NumberOfFiles,
        LimitKind::MemoryLocked,
        LimitKind::AddressSpace,
        LimitKind::Locks,
        LimitKind::SignalsPending,
        LimitKind::MessageQueueBytes,
        LimitKind::Nice,
        LimitKind::RealTimePriority,
        LimitKind::Rttime,
    ];
}

/// Value meaning "no limit"
pub const INFINITY: u64 = u64::MAX;

/// Soft and hard values of one limit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Limit {
    /// The value enforced by the kernel
    pub cur: u64,
    /// The ceiling for `cur`
    pub max: u64,
}

impl Limit {
    pub fn new(cur: u64, max: u64) -> Self {
        Self { cur, max }
    }

    pub fn unlimited() -> Self {
        Self {
            cur: INFINITY,
            max: INFINITY,
        }
    }
}

/// Resource limits of a thread group
///
/// Limits not explicitly set are unlimited.
#[derive(Debug, Default)]
pub struct LimitSet {
    data: Mutex<BTreeMap<LimitKind, Limit>>,
}

impl LimitSet {
    /// Creates a set with every limit unlimited
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a set with the defaults of a freshly booted Linux system
    pub fn linux_defaults() -> Self {
        let set = Self::new();
        {
            let mut data = set.data.lock();
            data.insert(LimitKind::Core, Limit::new(0, INFINITY));
            data.insert(LimitKind::Stack, Limit::new(8 << 20, INFINITY));
            data.insert(LimitKind::NumberOfFiles, Limit::new(1024, 4096));
            data.insert(LimitKind::MemoryLocked, Limit::new(64 << 10, 64 << 10));
            data.insert(LimitKind::SignalsPending, Limit::new(0, 0));
            data.insert(LimitKind::MessageQueueBytes, Limit::new(819_200, 819_200));
            data.insert(LimitKind::Nice, Limit::new(0, 0));
            data.insert(LimitKind::RealTimePriority, Limit::new(0, 0));
        }
        set
    }

    /// Returns the limit for `kind`
    pub fn get(&self, kind: LimitKind) -> Limit {
        self.data
            .lock()
            .get(&kind)
            .copied()
            .unwrap_or_else(Limit::unlimited)
    }

    /// Returns the soft value of `kind`
    pub fn get_cur(&self, kind: LimitKind) -> u64 {
        self.get(kind).cur
    }

    /// Sets `kind` to `new`, returning the previous value
    ///
    /// Raising the hard value requires `privileged`. The soft value may not
    /// exceed the hard value.
    pub fn set(&self, kind: LimitKind, new: Limit, privileged: bool) -> Result<Limit, Errno> {
        if new.cur > new.max {
            return Err(Errno::EINVAL);
        }
        let mut data = self.data.lock();
        let old = data.get(&kind).copied().unwrap_or_else(Limit::unlimited);
        if new.max > old.max && !privileged {
            return Err(Errno::EPERM);
        }
        data.insert(kind, new);
        Ok(old)
    }

    /// Sets `kind` without permission checks
    pub fn set_unchecked(&self, kind: LimitKind, new: Limit) {
        self.data.lock().insert(kind, new);
    }

    /// Returns an independent copy, as on fork
    pub fn copy(&self) -> Arc<LimitSet> {
        Arc::new(LimitSet {
            data: Mutex::new(self.data.lock().clone()),
        })
    }

    /// Returns every explicitly set limit
    pub fn snapshot(&self) -> BTreeMap<LimitKind, Limit> {
        self.data.lock().clone()
    }

    /// Rebuilds a limit set from [`LimitSet::snapshot`] output
    pub fn from_snapshot(data: BTreeMap<LimitKind, Limit>) -> Self {
        Self {
            data: Mutex::new(data),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_ticks_arithmetic() {
        let a = CpuTicks::new(10);
        let b = CpuTicks::new(3);
        assert_eq!(a.checked_add(b), Some(CpuTicks(13)));
        assert_eq!(b.checked_sub(a), None);
        assert_eq!(b.saturating_sub(a), CpuTicks::zero());
        assert!(CpuTicks::zero().is_zero());
    }

    #[test]
    fn test_cpu_ticks_overflow() {
        let max = CpuTicks::new(u64::MAX);
        assert_eq!(max.checked_add(CpuTicks(1)), None);
        assert_eq!(max.saturating_add(CpuTicks(1)), max);
    }

    #[test]
    fn test_unset_limits_are_unlimited() {
        let limits = LimitSet::new();
        assert_eq!(limits.get(LimitKind::ProcessCount), Limit::unlimited());
    }

    #[test]
    fn test_linux_defaults() {
        let limits = LimitSet::linux_defaults();
        assert_eq!(limits.get_cur(LimitKind::NumberOfFiles), 1024);
        assert_eq!(limits.get(LimitKind::ProcessCount).cur, INFINITY);
    }

    #[test]
    fn test_set_rejects_soft_above_hard() {
        let limits = LimitSet::new();
        assert_eq!(
            limits.set(LimitKind::ProcessCount, Limit::new(10, 5), true),
            Err(Errno::EINVAL)
        );
    }

    #[test]
    fn test_raising_hard_limit_requires_privilege() {
        let limits = LimitSet::new();
        limits
            .set(LimitKind::ProcessCount, Limit::new(5, 10), false)
            .unwrap();
        assert_eq!(
            limits.set(LimitKind::ProcessCount, Limit::new(5, 20), false),
            Err(Errno::EPERM)
        );
        let old = limits
            .set(LimitKind::ProcessCount, Limit::new(5, 20), true)
            .unwrap();
        assert_eq!(old, Limit::new(5, 10));
    }

    #[test]
    fn test_copy_is_independent() {
        let limits = LimitSet::new();
        limits.set_unchecked(LimitKind::Cpu, Limit::new(1, 2));
        let copy = limits.copy();
        copy.set_unchecked(LimitKind::Cpu, Limit::new(3, 4));
        assert_eq!(limits.get(LimitKind::Cpu), Limit::new(1, 2));
        assert_eq!(copy.get(LimitKind::Cpu), Limit::new(3, 4));
    }

    #[test]
    fn test_snapshot_restores() {
        let limits = LimitSet::linux_defaults();
        let restored = LimitSet::from_snapshot(limits.snapshot());
        assert_eq!(restored.snapshot(), limits.snapshot());
    }
}
