//! UTS, IPC and network namespaces
//!
//! Each namespace carries an explicit reference count. Every task holding
//! a namespace owns one reference, taken before the task stores it and
//! dropped exactly once when the task releases it. The kernel owns one
//! reference to each root namespace until it is released.

use identity::UserNamespace;
use kernel_api::NetworkStack;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// An explicit reference count
#[derive(Debug)]
pub struct RefCount {
    count: AtomicI64,
}

impl RefCount {
    /// Starts with one reference owned by the creator
    pub fn new() -> Self {
        Self {
            count: AtomicI64::new(1),
        }
    }

    pub fn inc_ref(&self) {
        let prev = self.count.fetch_add(1, Ordering::SeqCst);
        if prev <= 0 {
            panic!("incrementing reference count {} of a released object", prev);
        }
    }

    /// Drops a reference, returning true if it was the last one
    ///
    /// # Panics
    ///
    /// Panics if the count goes negative.
    pub fn dec_ref(&self) -> bool {
        let now = self.count.fetch_sub(1, Ordering::SeqCst) - 1;
        if now < 0 {
            panic!("negative reference count {}", now);
        }
        now == 0
    }

    pub fn read(&self) -> i64 {
        self.count.load(Ordering::SeqCst)
    }

    fn from_count(count: i64) -> Self {
        Self {
            count: AtomicI64::new(count),
        }
    }
}

impl Default for RefCount {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UtsNamespaceSnapshot {
    pub id: u64,
    pub user_namespace: u64,
    pub hostname: String,
    pub domainname: String,
    pub refs: i64,
}

#[derive(Debug, Clone)]
struct UtsNames {
    hostname: String,
    domainname: String,
}

/// Host and domain names
pub struct UtsNamespace {
    id: u64,
    user_ns: Arc<UserNamespace>,
    names: Mutex<UtsNames>,
    refs: RefCount,
}

impl UtsNamespace {
    pub fn new(
        id: u64,
        hostname: impl Into<String>,
        domainname: impl Into<String>,
        user_ns: Arc<UserNamespace>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            user_ns,
            names: Mutex::new(UtsNames {
                hostname: hostname.into(),
                domainname: domainname.into(),
            }),
            refs: RefCount::new(),
        })
    }

    /// Copies the names into a new namespace owned by `user_ns`
    pub fn copy_into(&self, id: u64, user_ns: Arc<UserNamespace>) -> Arc<Self> {
        let names = self.names.lock().clone();
        Self::new(id, names.hostname, names.domainname, user_ns)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn user_namespace(&self) -> &Arc<UserNamespace> {
        &self.user_ns
    }

    pub fn hostname(&self) -> String {
        self.names.lock().hostname.clone()
    }

    pub fn set_hostname(&self, hostname: impl Into<String>) {
        self.names.lock().hostname = hostname.into();
    }

    pub fn domainname(&self) -> String {
        self.names.lock().domainname.clone()
    }

    pub fn set_domainname(&self, domainname: impl Into<String>) {
        self.names.lock().domainname = domainname.into();
    }

    pub fn refs(&self) -> &RefCount {
        &self.refs
    }

    pub fn inc_ref(&self) {
        self.refs.inc_ref();
    }

    pub fn dec_ref(&self) {
        self.refs.dec_ref();
    }

    pub fn snapshot(&self) -> UtsNamespaceSnapshot {
        let names = self.names.lock();
        UtsNamespaceSnapshot {
            id: self.id,
            user_namespace: self.user_ns.id(),
            hostname: names.hostname.clone(),
            domainname: names.domainname.clone(),
            refs: self.refs.read(),
        }
    }

    pub fn from_snapshot(snapshot: &UtsNamespaceSnapshot, user_ns: Arc<UserNamespace>) -> Arc<Self> {
        Arc::new(Self {
            id: snapshot.id,
            user_ns,
            names: Mutex::new(UtsNames {
                hostname: snapshot.hostname.clone(),
                domainname: snapshot.domainname.clone(),
            }),
            refs: RefCount::from_count(snapshot.refs),
        })
    }
}

impl fmt::Debug for UtsNamespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UtsNamespace")
            .field("id", &self.id)
            .field("hostname", &self.names.lock().hostname)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpcNamespaceSnapshot {
    pub id: u64,
    pub user_namespace: u64,
    pub refs: i64,
}

/// System V IPC and POSIX message queue isolation
pub struct IpcNamespace {
    id: u64,
    user_ns: Arc<UserNamespace>,
    refs: RefCount,
}

impl IpcNamespace {
    pub fn new(id: u64, user_ns: Arc<UserNamespace>) -> Arc<Self> {
        Arc::new(Self {
            id,
            user_ns,
            refs: RefCount::new(),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn user_namespace(&self) -> &Arc<UserNamespace> {
        &self.user_ns
    }

    pub fn refs(&self) -> &RefCount {
        &self.refs
    }

    pub fn inc_ref(&self) {
        self.refs.inc_ref();
    }

    pub fn dec_ref(&self) {
        if self.refs.dec_ref() {
            debug!(id = self.id, "IPC namespace released");
        }
    }

    pub fn snapshot(&self) -> IpcNamespaceSnapshot {
        IpcNamespaceSnapshot {
            id: self.id,
            user_namespace: self.user_ns.id(),
            refs: self.refs.read(),
        }
    }

    pub fn from_snapshot(snapshot: &IpcNamespaceSnapshot, user_ns: Arc<UserNamespace>) -> Arc<Self> {
        Arc::new(Self {
            id: snapshot.id,
            user_ns,
            refs: RefCount::from_count(snapshot.refs),
        })
    }
}

impl fmt::Debug for IpcNamespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IpcNamespace").field("id", &self.id).finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkNamespaceSnapshot {
    pub id: u64,
    pub user_namespace: u64,
    pub is_root: bool,
    pub refs: i64,
}

/// A network namespace and the stack serving it
///
/// A namespace without a stack only offers loopback-free isolation; every
/// socket operation in it fails.
pub struct NetworkNamespace {
    id: u64,
    user_ns: Arc<UserNamespace>,
    is_root: bool,
    stack: Mutex<Option<Arc<dyn NetworkStack>>>,
    refs: RefCount,
}

impl NetworkNamespace {
    pub fn new_root(
        id: u64,
        user_ns: Arc<UserNamespace>,
        stack: Option<Arc<dyn NetworkStack>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            user_ns,
            is_root: true,
            stack: Mutex::new(stack),
            refs: RefCount::new(),
        })
    }

    pub fn new(id: u64, user_ns: Arc<UserNamespace>, stack: Option<Arc<dyn NetworkStack>>) -> Arc<Self> {
        Arc::new(Self {
            id,
            user_ns,
            is_root: false,
            stack: Mutex::new(stack),
            refs: RefCount::new(),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_root(&self) -> bool {
        self.is_root
    }

    pub fn user_namespace(&self) -> &Arc<UserNamespace> {
        &self.user_ns
    }

    pub fn stack(&self) -> Option<Arc<dyn NetworkStack>> {
        self.stack.lock().clone()
    }

    /// Installs the stack of a restored sandbox
    pub fn restore_stack(&self, stack: Arc<dyn NetworkStack>) {
        *self.stack.lock() = Some(stack);
    }

    pub fn refs(&self) -> &RefCount {
        &self.refs
    }

    pub fn inc_ref(&self) {
        self.refs.inc_ref();
    }

    /// Drops a reference, destroying the stack with the last one
    pub fn dec_ref(&self) {
        if self.refs.dec_ref() {
            if let Some(stack) = self.stack.lock().take() {
                stack.destroy();
            }
            debug!(id = self.id, "network namespace released");
        }
    }

    pub fn snapshot(&self) -> NetworkNamespaceSnapshot {
        NetworkNamespaceSnapshot {
            id: self.id,
            user_namespace: self.user_ns.id(),
            is_root: self.is_root,
            refs: self.refs.read(),
        }
    }

    /// Rebuilds a namespace; stacks are reattached by the restore path
    pub fn from_snapshot(snapshot: &NetworkNamespaceSnapshot, user_ns: Arc<UserNamespace>) -> Arc<Self> {
        Arc::new(Self {
            id: snapshot.id,
            user_ns,
            is_root: snapshot.is_root,
            stack: Mutex::new(None),
            refs: RefCount::from_count(snapshot.refs),
        })
    }
}

impl fmt::Debug for NetworkNamespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetworkNamespace")
            .field("id", &self.id)
            .field("is_root", &self.is_root)
            .field("has_stack", &self.stack.lock().is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::FakeNetworkStack;

    #[test]
    fn test_refcount_last_reference() {
        let refs = RefCount::new();
        refs.inc_ref();
        assert!(!refs.dec_ref());
        assert!(refs.dec_ref());
    }

    #[test]
    #[should_panic(expected = "negative reference count")]
    fn test_refcount_negative_panics() {
        let refs = RefCount::new();
        refs.dec_ref();
        refs.dec_ref();
    }

    #[test]
    fn test_uts_clone_copies_names() {
        let root = UserNamespace::new_root();
        let uts = UtsNamespace::new(0, "sandbox", "local", root.clone());
        let copy = uts.copy_into(7, root);
        copy.set_hostname("other");
        assert_eq!(uts.hostname(), "sandbox");
        assert_eq!(copy.hostname(), "other");
        assert_eq!(copy.domainname(), "local");
    }

    #[test]
    fn test_last_network_reference_destroys_stack() {
        let stack = FakeNetworkStack::new();
        let ns = NetworkNamespace::new_root(0, UserNamespace::new_root(), Some(stack.clone()));
        ns.inc_ref();
        ns.dec_ref();
        assert_eq!(stack.destroyed(), 0);
        ns.dec_ref();
        assert_eq!(stack.destroyed(), 1);
        assert!(ns.stack().is_none());
    }
}
