//! Per-task filesystem context

use kernel_api::VirtualDentry;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsContextSnapshot {
    pub uid: u64,
    pub root: VirtualDentry,
    pub cwd: VirtualDentry,
    pub umask: u32,
}

#[derive(Debug, Clone)]
struct FsState {
    root: VirtualDentry,
    cwd: VirtualDentry,
    umask: u32,
}

/// Root directory, working directory and umask
#[derive(Debug)]
pub struct FsContext {
    uid: u64,
    state: Mutex<FsState>,
}

impl FsContext {
    pub fn new(uid: u64, root: VirtualDentry, cwd: VirtualDentry, umask: u32) -> Arc<Self> {
        Arc::new(Self {
            uid,
            state: Mutex::new(FsState { root, cwd, umask }),
        })
    }

    pub fn uid(&self) -> u64 {
        self.uid
    }

    pub fn root(&self) -> VirtualDentry {
        self.state.lock().root.clone()
    }

    pub fn working_directory(&self) -> VirtualDentry {
        self.state.lock().cwd.clone()
    }

    pub fn set_working_directory(&self, cwd: VirtualDentry) {
        self.state.lock().cwd = cwd;
    }

    pub fn umask(&self) -> u32 {
        self.state.lock().umask
    }

    /// Sets the umask, returning the old one
    pub fn swap_umask(&self, umask: u32) -> u32 {
        std::mem::replace(&mut self.state.lock().umask, umask & 0o777)
    }

    /// Replaces `old` wherever it is used as root or working directory
    pub fn replace_root(&self, old: &VirtualDentry, new: &VirtualDentry) {
        let mut state = self.state.lock();
        if state.root == *old {
            state.root = new.clone();
        }
        if state.cwd == *old {
            state.cwd = new.clone();
        }
    }

    /// Copies the context, as for fork(2) without CLONE_FS
    pub fn fork(&self, uid: u64) -> Arc<Self> {
        Arc::new(Self {
            uid,
            state: Mutex::new(self.state.lock().clone()),
        })
    }

    pub fn snapshot(&self) -> FsContextSnapshot {
        let state = self.state.lock();
        FsContextSnapshot {
            uid: self.uid,
            root: state.root.clone(),
            cwd: state.cwd.clone(),
            umask: state.umask,
        }
    }

    pub fn from_snapshot(snapshot: &FsContextSnapshot) -> Arc<Self> {
        Self::new(
            snapshot.uid,
            snapshot.root.clone(),
            snapshot.cwd.clone(),
            snapshot.umask,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replace_root() {
        let old = VirtualDentry::new(1, "/");
        let new = VirtualDentry::new(2, "/");
        let ctx = FsContext::new(1, old.clone(), VirtualDentry::new(1, "/tmp"), 0o022);
        ctx.replace_root(&old, &new);
        assert_eq!(ctx.root(), new);
        assert_eq!(ctx.working_directory(), VirtualDentry::new(1, "/tmp"));
    }

    #[test]
    fn test_fork_and_umask() {
        let ctx = FsContext::new(1, VirtualDentry::new(1, "/"), VirtualDentry::new(1, "/"), 0o022);
        let child = ctx.fork(2);
        assert_eq!(child.swap_umask(0o077), 0o022);
        assert_eq!(ctx.umask(), 0o022);
        assert_eq!(child.snapshot().uid, 2);
    }
}
