//! Container ID to name mapping

use super::Kernel;
use std::collections::BTreeMap;

impl Kernel {
    pub fn register_container_name(&self, cid: &str, name: &str) {
        let _extern = self.lock_external();
        self.inner()
            .container_names
            .insert(cid.to_string(), name.to_string());
    }

    /// Replaces the mapping after a restore
    ///
    /// `container_ids` maps each container name, which survives the
    /// restore, to its new container ID.
    pub fn restore_container_mapping(&self, container_ids: &BTreeMap<String, String>) {
        let _extern = self.lock_external();
        self.inner().container_names = container_ids
            .iter()
            .map(|(name, cid)| (cid.clone(), name.clone()))
            .collect();
    }

    /// Name of container `cid`, or an empty string if it is unknown
    pub fn container_name(&self, cid: &str) -> String {
        let _extern = self.lock_external();
        self.inner()
            .container_names
            .get(cid)
            .cloned()
            .unwrap_or_default()
    }
}
