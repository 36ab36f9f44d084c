//! Cgroup hierarchy transitions and cgroup mounts

use super::Kernel;
use crate::cgroup::{CgroupMount, CgroupNode, Hierarchy};
use crate::task::{ExitState, Task};
use core_types::{Errno, HierarchyId};
use std::sync::Arc;
use tracing::debug;

impl Kernel {
    /// Registers a hierarchy for `controllers` and moves every live task
    /// into its root
    pub fn register_cgroup_hierarchy(
        &self,
        name: &str,
        controllers: &[&str],
    ) -> Result<Arc<Hierarchy>, Errno> {
        let hierarchy = self.cgroup_registry().register(name, controllers)?;
        self.populate_new_cgroup_hierarchy(hierarchy.root());
        Ok(hierarchy)
    }

    /// Moves every live task into `root`, a new hierarchy's root cgroup
    ///
    /// Tasks that are exiting are skipped, as are tasks created after the
    /// hierarchy was registered, which already joined it.
    pub fn populate_new_cgroup_hierarchy(&self, root: &Arc<CgroupNode>) {
        let state = self.task_set().read();
        let mut entered = 0usize;
        for task in state.tasks.values() {
            let mut inner = task.lock();
            if inner.exit_state != ExitState::Running {
                continue;
            }
            if inner.cgroups.contains_key(&root.hierarchy()) {
                continue;
            }
            root.enter(task.key());
            inner.cgroups.insert(root.hierarchy(), Arc::clone(root));
            entered += 1;
        }
        debug!(hierarchy = %root.hierarchy(), entered, "populated cgroup hierarchy");
    }

    /// Moves every live task out of hierarchy `hid` and unregisters it
    pub fn release_cgroup_hierarchy(&self, hid: HierarchyId) {
        let mut released = 0usize;
        {
            let state = self.task_set().read();
            for task in state.tasks.values() {
                let mut inner = task.lock();
                if inner.exit_state != ExitState::Running {
                    continue;
                }
                if let Some(cgroup) = inner.cgroups.remove(&hid) {
                    cgroup.leave(task.key());
                    released += 1;
                }
            }
        }
        self.cgroup_registry().unregister(hid);
        debug!(hierarchy = %hid, released, "released cgroup hierarchy");
    }

    /// Moves `task` to `dst`, leaving its cgroup in the same hierarchy
    ///
    /// Fails with ESRCH once the task is exiting.
    pub fn migrate_cgroup(&self, task: &Task, dst: &Arc<CgroupNode>) -> Result<(), Errno> {
        let mut inner = task.lock();
        if inner.exit_state != ExitState::Running {
            return Err(Errno::ESRCH);
        }
        if let Some(src) = inner.cgroups.get(&dst.hierarchy()) {
            if Arc::ptr_eq(src, dst) {
                return Ok(());
            }
            src.leave(task.key());
        }
        dst.enter(task.key());
        inner.cgroups.insert(dst.hierarchy(), Arc::clone(dst));
        Ok(())
    }

    /// Records the mount of `controller`'s hierarchy; the kernel holds it
    /// until [`Kernel::release`]
    pub fn add_cgroup_mount(&self, controller: &str, mount: CgroupMount) {
        self.inner()
            .cgroup_mounts
            .insert(controller.to_string(), mount);
    }

    pub fn get_cgroup_mount(&self, controller: &str) -> Option<CgroupMount> {
        self.inner().cgroup_mounts.get(controller).cloned()
    }
}
