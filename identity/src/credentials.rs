//! Task credentials

use crate::user_namespace::UserNamespace;
use core_types::{Capability, CapabilitySet, Errno, Kgid, Kuid};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Capabilities attached to an executable file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileCapabilities {
    pub permitted: CapabilitySet,
    pub inheritable: CapabilitySet,
    /// If set, the new permitted set also becomes the effective set
    pub effective: bool,
}

/// The security identity of a task
///
/// Credentials are immutable once shared; changing them means building a
/// new value and swapping the task's reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub real_kuid: Kuid,
    pub effective_kuid: Kuid,
    pub saved_kuid: Kuid,
    pub real_kgid: Kgid,
    pub effective_kgid: Kgid,
    pub saved_kgid: Kgid,
    pub extra_kgids: Vec<Kgid>,
    pub permitted_caps: CapabilitySet,
    pub inheritable_caps: CapabilitySet,
    pub effective_caps: CapabilitySet,
    pub bounding_caps: CapabilitySet,
    pub keep_caps: bool,
    pub user_namespace: Arc<UserNamespace>,
}

/// Serialized form of [`Credentials`]; the user namespace is referenced by ID
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialsSnapshot {
    pub real_kuid: Kuid,
    pub effective_kuid: Kuid,
    pub saved_kuid: Kuid,
    pub real_kgid: Kgid,
    pub effective_kgid: Kgid,
    pub saved_kgid: Kgid,
    pub extra_kgids: Vec<Kgid>,
    pub permitted_caps: CapabilitySet,
    pub inheritable_caps: CapabilitySet,
    pub effective_caps: CapabilitySet,
    pub bounding_caps: CapabilitySet,
    pub keep_caps: bool,
    pub user_namespace: u64,
}

impl Credentials {
    /// Credentials of the superuser in `ns`
    pub fn new_root(ns: Arc<UserNamespace>) -> Self {
        Self {
            real_kuid: Kuid::ROOT,
            effective_kuid: Kuid::ROOT,
            saved_kuid: Kuid::ROOT,
            real_kgid: Kgid::ROOT,
            effective_kgid: Kgid::ROOT,
            saved_kgid: Kgid::ROOT,
            extra_kgids: Vec::new(),
            permitted_caps: CapabilitySet::all(),
            inheritable_caps: CapabilitySet::empty(),
            effective_caps: CapabilitySet::all(),
            bounding_caps: CapabilitySet::all(),
            keep_caps: false,
            user_namespace: ns,
        }
    }

    /// Credentials of an ordinary user
    ///
    /// Root gets every capability unless `caps` says otherwise; other users
    /// get `caps` or nothing.
    pub fn new_user(
        kuid: Kuid,
        kgid: Kgid,
        extra_kgids: Vec<Kgid>,
        caps: Option<CapabilitySet>,
        ns: Arc<UserNamespace>,
    ) -> Self {
        let mut creds = Self::new_root(ns);
        creds.real_kuid = kuid;
        creds.effective_kuid = kuid;
        creds.saved_kuid = kuid;
        creds.real_kgid = kgid;
        creds.effective_kgid = kgid;
        creds.saved_kgid = kgid;
        creds.extra_kgids = extra_kgids;
        let caps = match caps {
            Some(caps) => caps,
            None if kuid == Kuid::ROOT => CapabilitySet::all(),
            None => CapabilitySet::empty(),
        };
        creds.permitted_caps = caps;
        creds.effective_caps = caps;
        creds
    }

    /// Reports whether these credentials hold `cap` in `ns`
    ///
    /// A task has a capability in a namespace if it has it in the effective
    /// set and the namespace is its own, or if it owns some ancestor of the
    /// namespace that is a child of its own namespace.
    pub fn has_capability_in(&self, cap: Capability, ns: &Arc<UserNamespace>) -> bool {
        let mut current = Some(Arc::clone(ns));
        while let Some(candidate) = current {
            if *candidate == *self.user_namespace {
                return self.effective_caps.contains(cap);
            }
            let parent = candidate.parent().cloned();
            if let Some(parent) = &parent {
                if **parent == *self.user_namespace
                    && candidate.owner() == self.effective_kuid
                {
                    return true;
                }
            }
            current = parent;
        }
        false
    }

    /// Reports whether these credentials hold `cap` in their own namespace
    pub fn has_capability(&self, cap: Capability) -> bool {
        self.has_capability_in(cap, &self.user_namespace)
    }

    /// Reports whether `kgid` is the effective or a supplementary group
    pub fn in_group(&self, kgid: Kgid) -> bool {
        self.effective_kgid == kgid || self.extra_kgids.contains(&kgid)
    }

    /// Computes the credentials of a task that starts running a new image
    ///
    /// Applies execve(2) capability rules: file capabilities grant what the
    /// bounding set allows; otherwise root keeps its permitted set and every
    /// other user loses its capabilities.
    pub fn for_new_task(&self, file_caps: Option<&FileCapabilities>) -> Result<Self, Errno> {
        let mut creds = self.clone();
        match file_caps {
            Some(fcaps) => {
                let permitted = self
                    .inheritable_caps
                    .intersection(fcaps.inheritable)
                    .union(fcaps.permitted.intersection(self.bounding_caps));
                if !fcaps.permitted.is_subset_of(permitted) {
                    return Err(Errno::EPERM);
                }
                creds.permitted_caps = permitted;
                creds.effective_caps = if fcaps.effective {
                    permitted
                } else {
                    CapabilitySet::empty()
                };
            }
            None if self.effective_kuid == Kuid::ROOT || self.real_kuid == Kuid::ROOT => {
                creds.permitted_caps = self.inheritable_caps.union(self.bounding_caps);
                creds.effective_caps = if self.effective_kuid == Kuid::ROOT {
                    creds.permitted_caps
                } else {
                    CapabilitySet::empty()
                };
            }
            None => {
                creds.permitted_caps = CapabilitySet::empty();
                creds.effective_caps = CapabilitySet::empty();
            }
        }
        creds.saved_kuid = creds.effective_kuid;
        creds.saved_kgid = creds.effective_kgid;
        Ok(creds)
    }

    pub fn snapshot(&self) -> CredentialsSnapshot {
        CredentialsSnapshot {
            real_kuid: self.real_kuid,
            effective_kuid: self.effective_kuid,
            saved_kuid: self.saved_kuid,
            real_kgid: self.real_kgid,
            effective_kgid: self.effective_kgid,
            saved_kgid: self.saved_kgid,
            extra_kgids: self.extra_kgids.clone(),
            permitted_caps: self.permitted_caps,
            inheritable_caps: self.inheritable_caps,
            effective_caps: self.effective_caps,
            bounding_caps: self.bounding_caps,
            keep_caps: self.keep_caps,
            user_namespace: self.user_namespace.id(),
        }
    }

    /// Rebuilds credentials; `ns` must be the namespace named by the snapshot
    pub fn from_snapshot(snapshot: &CredentialsSnapshot, ns: Arc<UserNamespace>) -> Self {
        Self {
            real_kuid: snapshot.real_kuid,
            effective_kuid: snapshot.effective_kuid,
            saved_kuid: snapshot.saved_kuid,
            real_kgid: snapshot.real_kgid,
            effective_kgid: snapshot.effective_kgid,
            saved_kgid: snapshot.saved_kgid,
            extra_kgids: snapshot.extra_kgids.clone(),
            permitted_caps: snapshot.permitted_caps,
            inheritable_caps: snapshot.inheritable_caps,
            effective_caps: snapshot.effective_caps,
            bounding_caps: snapshot.bounding_caps,
            keep_caps: snapshot.keep_caps,
            user_namespace: ns,
        }
    }
}
