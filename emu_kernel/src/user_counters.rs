//! Per-user resource counters

use core_types::{Capability, Errno, Kuid};
use identity::Credentials;
use resources::{LimitKind, LimitSet};
use std::sync::atomic::{AtomicU64, Ordering};

/// Resource usage charged to one user across the whole sandbox
#[derive(Debug)]
pub struct UserCounters {
    uid: Kuid,
    rlimit_nproc: AtomicU64,
}

impl UserCounters {
    pub fn new(uid: Kuid) -> Self {
        Self {
            uid,
            rlimit_nproc: AtomicU64::new(0),
        }
    }

    pub fn uid(&self) -> Kuid {
        self.uid
    }

    /// Number of live tasks owned by the user
    pub fn process_count(&self) -> u64 {
        self.rlimit_nproc.load(Ordering::SeqCst)
    }

    /// Charges one task against the process-count limit
    ///
    /// Holders of CAP_SYS_ADMIN or CAP_SYS_RESOURCE are not limited.
    pub fn inc_rlimit_nproc(&self, creds: &Credentials, limits: &LimitSet) -> Result<(), Errno> {
        let limit = limits.get_cur(LimitKind::ProcessCount);
        let nproc = self.rlimit_nproc.fetch_add(1, Ordering::SeqCst) + 1;
        if nproc > limit
            && !creds.has_capability(Capability::SYS_ADMIN)
            && !creds.has_capability(Capability::SYS_RESOURCE)
        {
            self.rlimit_nproc.fetch_sub(1, Ordering::SeqCst);
            return Err(Errno::EAGAIN);
        }
        Ok(())
    }

    pub fn dec_rlimit_nproc(&self) {
        let prev = self.rlimit_nproc.fetch_sub(1, Ordering::SeqCst);
        if prev == 0 {
            panic!("process count of {} went negative", self.uid);
        }
    }

    /// Sets the counter when rebuilding a restored kernel
    pub(crate) fn set_process_count(&self, count: u64) {
        self.rlimit_nproc.store(count, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_types::{CapabilitySet, Kgid};
    use identity::UserNamespace;
    use resources::Limit;

    fn user_creds(caps: CapabilitySet) -> Credentials {
        Credentials::new_user(Kuid(1000), Kgid(1000), vec![], Some(caps), UserNamespace::new_root())
    }

    fn limits(max: u64) -> LimitSet {
        let limits = LimitSet::new();
        limits.set_unchecked(LimitKind::ProcessCount, Limit::new(max, max));
        limits
    }

    #[test]
    fn test_limit_enforced() {
        let counters = UserCounters::new(Kuid(1000));
        let creds = user_creds(CapabilitySet::empty());
        let limits = limits(2);
        counters.inc_rlimit_nproc(&creds, &limits).unwrap();
        counters.inc_rlimit_nproc(&creds, &limits).unwrap();
        assert_eq!(counters.inc_rlimit_nproc(&creds, &limits), Err(Errno::EAGAIN));
        assert_eq!(counters.process_count(), 2);
        counters.dec_rlimit_nproc();
        counters.inc_rlimit_nproc(&creds, &limits).unwrap();
    }

    #[test]
    fn test_privileged_users_bypass_limit() {
        let counters = UserCounters::new(Kuid(1000));
        let limits = limits(0);
        let admin = user_creds(CapabilitySet::of(&[Capability::SYS_ADMIN]));
        let resource = user_creds(CapabilitySet::of(&[Capability::SYS_RESOURCE]));
        counters.inc_rlimit_nproc(&admin, &limits).unwrap();
        counters.inc_rlimit_nproc(&resource, &limits).unwrap();
        assert_eq!(counters.process_count(), 2);
    }

    #[test]
    #[should_panic(expected = "went negative")]
    fn test_underflow_panics() {
        UserCounters::new(Kuid(0)).dec_rlimit_nproc();
    }
}
