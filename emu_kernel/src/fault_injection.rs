//! Deterministic fault injection for testing
//!
//! The fake collaborators in [`crate::test_utils`] consult a shared
//! [`FaultInjector`] at the points where a real collaborator can fail
//! during checkpoint and restore.
//!
//! ## Example
//!
//! ```
//! use emu_kernel::fault_injection::{CheckpointFault, FaultInjector, FaultPlan};
//!
//! let plan = FaultPlan::new()
//!     .with_fault(CheckpointFault::FailLoads { count: 1 })
//!     .with_fault(CheckpointFault::FailSaves { count: 1 });
//! let injector = FaultInjector::new(plan);
//! assert!(injector.should_fail_load());
//! assert!(!injector.should_fail_load());
//! ```

use kernel_api::FeatureSet;
use parking_lot::Mutex;
use std::sync::Arc;

/// A fault to inject
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckpointFault {
    /// Fail the next `count` memory file loads
    FailLoads { count: usize },

    /// Fail the next `count` memory file saves
    FailSaves { count: usize },

    /// Report this feature set as the host's
    HostFeatures(FeatureSet),
}

/// All faults a test wants injected
#[derive(Debug, Clone, Default)]
pub struct FaultPlan {
    faults: Vec<CheckpointFault>,
}

impl FaultPlan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fault(mut self, fault: CheckpointFault) -> Self {
        self.faults.push(fault);
        self
    }

    pub fn faults(&self) -> &[CheckpointFault] {
        &self.faults
    }
}

#[derive(Debug, Default)]
struct InjectorState {
    fail_loads: usize,
    fail_saves: usize,
    host_features: Option<FeatureSet>,
    injected: usize,
}

/// Applies a [`FaultPlan`]; shared by every fake that can fail
#[derive(Debug, Default)]
pub struct FaultInjector {
    state: Mutex<InjectorState>,
}

impl FaultInjector {
    pub fn new(plan: FaultPlan) -> Arc<Self> {
        let mut state = InjectorState::default();
        for fault in plan.faults() {
            match fault {
                CheckpointFault::FailLoads { count } => state.fail_loads += count,
                CheckpointFault::FailSaves { count } => state.fail_saves += count,
                CheckpointFault::HostFeatures(features) => {
                    state.host_features = Some(features.clone());
                }
            }
        }
        Arc::new(Self {
            state: Mutex::new(state),
        })
    }

    /// An injector that never fails anything
    pub fn none() -> Arc<Self> {
        Self::new(FaultPlan::new())
    }

    /// Consumes one planned load failure, if any remain
    pub fn should_fail_load(&self) -> bool {
        let mut state = self.state.lock();
        if state.fail_loads == 0 {
            return false;
        }
        state.fail_loads -= 1;
        state.injected += 1;
        true
    }

    /// Consumes one planned save failure, if any remain
    pub fn should_fail_save(&self) -> bool {
        let mut state = self.state.lock();
        if state.fail_saves == 0 {
            return false;
        }
        state.fail_saves -= 1;
        state.injected += 1;
        true
    }

    pub fn host_features(&self) -> Option<FeatureSet> {
        self.state.lock().host_features.clone()
    }

    /// Number of failures injected so far
    pub fn injected(&self) -> usize {
        self.state.lock().injected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_plan_injects_nothing() {
        let injector = FaultInjector::none();
        assert!(!injector.should_fail_load());
        assert!(!injector.should_fail_save());
        assert!(injector.host_features().is_none());
        assert_eq!(injector.injected(), 0);
    }

    #[test]
    fn test_counted_faults_are_consumed() {
        let injector = FaultInjector::new(
            FaultPlan::new()
                .with_fault(CheckpointFault::FailSaves { count: 2 })
                .with_fault(CheckpointFault::FailLoads { count: 1 }),
        );
        assert!(injector.should_fail_save());
        assert!(injector.should_fail_save());
        assert!(!injector.should_fail_save());
        assert!(injector.should_fail_load());
        assert!(!injector.should_fail_load());
        assert_eq!(injector.injected(), 3);
    }

    #[test]
    fn test_host_features_override() {
        let features = FeatureSet::new("AuthenticAMD", ["sse2"]);
        let injector =
            FaultInjector::new(FaultPlan::new().with_fault(CheckpointFault::HostFeatures(features.clone())));
        assert_eq!(injector.host_features(), Some(features));
    }
}
