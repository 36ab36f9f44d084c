//! Emulated CPU features

use crate::error::KernelError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// The CPU features exposed to sandboxed applications
///
/// Applications may start using any feature in the set, so a checkpoint can
/// only be restored on a host that offers all of them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSet {
    pub vendor: String,
    pub features: BTreeSet<String>,
}

impl FeatureSet {
    pub fn new<I, S>(vendor: impl Into<String>, features: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            vendor: vendor.into(),
            features: features.into_iter().map(Into::into).collect(),
        }
    }

    pub fn has(&self, feature: &str) -> bool {
        self.features.contains(feature)
    }

    /// Checks that `host` can run applications that saw `self`
    pub fn check_host_compatible(&self, host: &FeatureSet) -> Result<(), KernelError> {
        if self.vendor != host.vendor {
            return Err(KernelError::HostIncompatible(format!(
                "vendor mismatch: saved {:?}, host {:?}",
                self.vendor, host.vendor
            )));
        }
        let missing: Vec<&str> = self
            .features
            .difference(&host.features)
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            return Err(KernelError::HostIncompatible(format!(
                "missing features: {}",
                missing.join(", ")
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_superset_host_is_compatible() {
        let saved = FeatureSet::new("GenuineIntel", ["sse2", "avx"]);
        let host = FeatureSet::new("GenuineIntel", ["sse2", "avx", "avx2"]);
        assert!(saved.check_host_compatible(&host).is_ok());
    }

    #[test]
    fn test_missing_feature_is_reported() {
        let saved = FeatureSet::new("GenuineIntel", ["sse2", "avx512f"]);
        let host = FeatureSet::new("GenuineIntel", ["sse2"]);
        match saved.check_host_compatible(&host) {
            Err(KernelError::HostIncompatible(msg)) => assert!(msg.contains("avx512f")),
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn test_vendor_mismatch() {
        let saved = FeatureSet::new("GenuineIntel", ["sse2"]);
        let host = FeatureSet::new("AuthenticAMD", ["sse2"]);
        assert!(saved.check_host_compatible(&host).is_err());
    }
}
