//! Cgroup hierarchies and task membership
//!
//! The registry knows every hierarchy and the controllers bound to it. A
//! controller may be bound to at most one hierarchy. Within a hierarchy a
//! task is a member of exactly one cgroup; the membership count of a
//! cgroup is the number of tasks holding it.

use core_types::{CgroupId, Errno, HierarchyId, TaskKey};
use kernel_api::VirtualDentry;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Arc, Weak};

/// One cgroup in a hierarchy
pub struct CgroupNode {
    id: CgroupId,
    hierarchy: HierarchyId,
    path: String,
    parent: Option<Weak<CgroupNode>>,
    members: Mutex<BTreeSet<TaskKey>>,
    children: Mutex<BTreeMap<String, Arc<CgroupNode>>>,
}

impl CgroupNode {
    fn new(
        id: CgroupId,
        hierarchy: HierarchyId,
        path: String,
        parent: Option<Weak<CgroupNode>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            hierarchy,
            path,
            parent,
            members: Mutex::new(BTreeSet::new()),
            children: Mutex::new(BTreeMap::new()),
        })
    }

    pub fn id(&self) -> CgroupId {
        self.id
    }

    pub fn hierarchy(&self) -> HierarchyId {
        self.hierarchy
    }

    /// Path relative to the hierarchy root, "/" for the root itself
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn parent(&self) -> Option<Arc<CgroupNode>> {
        self.parent.as_ref().and_then(Weak::upgrade)
    }

    pub fn child(&self, name: &str) -> Option<Arc<CgroupNode>> {
        self.children.lock().get(name).cloned()
    }

    pub fn children(&self) -> Vec<Arc<CgroupNode>> {
        self.children.lock().values().cloned().collect()
    }

    /// Number of member tasks
    pub fn member_count(&self) -> usize {
        self.members.lock().len()
    }

    pub fn members(&self) -> Vec<TaskKey> {
        self.members.lock().iter().copied().collect()
    }

    pub fn contains(&self, task: TaskKey) -> bool {
        self.members.lock().contains(&task)
    }

    /// Adds `task` as a member
    ///
    /// # Panics
    ///
    /// Panics if the task is already a member.
    pub fn enter(&self, task: TaskKey) {
        if !self.members.lock().insert(task) {
            panic!("{} entered {} twice", task, self.id);
        }
    }

    /// Removes `task`
    ///
    /// # Panics
    ///
    /// Panics if the task is not a member.
    pub fn leave(&self, task: TaskKey) {
        if !self.members.lock().remove(&task) {
            panic!("{} left {} without being a member", task, self.id);
        }
    }
}

impl fmt::Debug for CgroupNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CgroupNode")
            .field("id", &self.id)
            .field("hierarchy", &self.hierarchy)
            .field("path", &self.path)
            .finish()
    }
}

/// A tree of cgroups with its bound controllers
#[derive(Debug)]
pub struct Hierarchy {
    id: HierarchyId,
    name: String,
    controllers: BTreeSet<String>,
    root: Arc<CgroupNode>,
}

impl Hierarchy {
    pub fn id(&self) -> HierarchyId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn controllers(&self) -> &BTreeSet<String> {
        &self.controllers
    }

    pub fn root(&self) -> &Arc<CgroupNode> {
        &self.root
    }
}

/// Where a controller's hierarchy is mounted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CgroupMount {
    pub controller: String,
    pub hierarchy: HierarchyId,
    pub mount: VirtualDentry,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CgroupNodeSnapshot {
    pub id: CgroupId,
    pub parent: Option<CgroupId>,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HierarchySnapshot {
    pub id: HierarchyId,
    pub name: String,
    pub controllers: Vec<String>,
    /// Parents precede their children; the first node is the root
    pub nodes: Vec<CgroupNodeSnapshot>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CgroupRegistrySnapshot {
    pub next_hierarchy: u32,
    pub next_cgroup: u32,
    pub hierarchies: Vec<HierarchySnapshot>,
}

#[derive(Default)]
struct RegistryState {
    next_hierarchy: u32,
    next_cgroup: u32,
    hierarchies: BTreeMap<HierarchyId, Arc<Hierarchy>>,
    by_controller: BTreeMap<String, HierarchyId>,
    cgroups: BTreeMap<CgroupId, Weak<CgroupNode>>,
}

impl RegistryState {
    fn alloc_cgroup(&mut self) -> CgroupId {
        self.next_cgroup += 1;
        CgroupId(self.next_cgroup)
    }
}

/// Registry of every cgroup hierarchy in the kernel
#[derive(Default)]
pub struct CgroupRegistry {
    state: Mutex<RegistryState>,
}

impl CgroupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a hierarchy for `controllers`
    ///
    /// Fails with EBUSY if any controller is already bound.
    pub fn register(&self, name: &str, controllers: &[&str]) -> Result<Arc<Hierarchy>, Errno> {
        let mut state = self.state.lock();
        if controllers
            .iter()
            .any(|c| state.by_controller.contains_key(*c))
        {
            return Err(Errno::EBUSY);
        }
        state.next_hierarchy += 1;
        let id = HierarchyId(state.next_hierarchy);
        let root_id = state.alloc_cgroup();
        let root = CgroupNode::new(root_id, id, "/".to_string(), None);
        let hierarchy = Arc::new(Hierarchy {
            id,
            name: name.to_string(),
            controllers: controllers.iter().map(|c| c.to_string()).collect(),
            root: Arc::clone(&root),
        });
        for controller in controllers {
            state.by_controller.insert(controller.to_string(), id);
        }
        state.cgroups.insert(root_id, Arc::downgrade(&root));
        state.hierarchies.insert(id, Arc::clone(&hierarchy));
        Ok(hierarchy)
    }

    /// Removes a hierarchy, unbinding its controllers
    pub fn unregister(&self, id: HierarchyId) -> Option<Arc<Hierarchy>> {
        let mut state = self.state.lock();
        let hierarchy = state.hierarchies.remove(&id)?;
        state.by_controller.retain(|_, h| *h != id);
        state.cgroups.retain(|_, node| {
            node.upgrade()
                .is_some_and(|node| node.hierarchy() != id)
        });
        Some(hierarchy)
    }

    /// Creates cgroup `name` below `parent`; EEXIST if it already exists
    pub fn create_child(&self, parent: &Arc<CgroupNode>, name: &str) -> Result<Arc<CgroupNode>, Errno> {
        if name.is_empty() || name.contains('/') {
            return Err(Errno::EINVAL);
        }
        let mut state = self.state.lock();
        if !state.hierarchies.contains_key(&parent.hierarchy()) {
            return Err(Errno::ENOENT);
        }
        let mut children = parent.children.lock();
        if children.contains_key(name) {
            return Err(Errno::EEXIST);
        }
        let id = state.alloc_cgroup();
        let path = if parent.path == "/" {
            format!("/{}", name)
        } else {
            format!("{}/{}", parent.path, name)
        };
        let node = CgroupNode::new(id, parent.hierarchy(), path, Some(Arc::downgrade(parent)));
        children.insert(name.to_string(), Arc::clone(&node));
        state.cgroups.insert(id, Arc::downgrade(&node));
        Ok(node)
    }

    /// Removes an empty cgroup with no children
    pub fn remove_child(&self, node: &Arc<CgroupNode>) -> Result<(), Errno> {
        let parent = node.parent().ok_or(Errno::EBUSY)?;
        let mut state = self.state.lock();
        let mut siblings = parent.children.lock();
        if node.member_count() > 0 || !node.children.lock().is_empty() {
            return Err(Errno::EBUSY);
        }
        let name = node.path.rsplit('/').next().unwrap_or_default();
        siblings.remove(name);
        state.cgroups.remove(&node.id());
        Ok(())
    }

    pub fn hierarchy(&self, id: HierarchyId) -> Option<Arc<Hierarchy>> {
        self.state.lock().hierarchies.get(&id).cloned()
    }

    pub fn hierarchy_for_controller(&self, controller: &str) -> Option<Arc<Hierarchy>> {
        let state = self.state.lock();
        let id = state.by_controller.get(controller)?;
        state.hierarchies.get(id).cloned()
    }

    pub fn hierarchies(&self) -> Vec<Arc<Hierarchy>> {
        self.state.lock().hierarchies.values().cloned().collect()
    }

    pub fn cgroup(&self, id: CgroupId) -> Option<Arc<CgroupNode>> {
        self.state.lock().cgroups.get(&id).and_then(Weak::upgrade)
    }

    /// The root cgroup of every hierarchy
    pub fn root_cgroups(&self) -> BTreeMap<HierarchyId, Arc<CgroupNode>> {
        self.state
            .lock()
            .hierarchies
            .iter()
            .map(|(id, h)| (*id, Arc::clone(&h.root)))
            .collect()
    }

    pub fn snapshot(&self) -> CgroupRegistrySnapshot {
        let state = self.state.lock();
        let hierarchies = state
            .hierarchies
            .values()
            .map(|h| {
                let mut nodes = Vec::new();
                let mut queue = vec![(Arc::clone(&h.root), None, String::new())];
                while let Some((node, parent, name)) = queue.pop() {
                    nodes.push(CgroupNodeSnapshot {
                        id: node.id,
                        parent,
                        name,
                    });
                    let children = node.children.lock();
                    for (child_name, child) in children.iter().rev() {
                        queue.push((Arc::clone(child), Some(node.id), child_name.clone()));
                    }
                }
                HierarchySnapshot {
                    id: h.id,
                    name: h.name.clone(),
                    controllers: h.controllers.iter().cloned().collect(),
                    nodes,
                }
            })
            .collect();
        CgroupRegistrySnapshot {
            next_hierarchy: state.next_hierarchy,
            next_cgroup: state.next_cgroup,
            hierarchies,
        }
    }

    /// Rebuilds the registry; memberships are restored by their tasks
    pub fn from_snapshot(snapshot: &CgroupRegistrySnapshot) -> Result<Self, Errno> {
        let mut state = RegistryState {
            next_hierarchy: snapshot.next_hierarchy,
            next_cgroup: snapshot.next_cgroup,
            ..RegistryState::default()
        };
        for hs in &snapshot.hierarchies {
            let mut nodes: BTreeMap<CgroupId, Arc<CgroupNode>> = BTreeMap::new();
            let mut root = None;
            for ns in &hs.nodes {
                let node = match ns.parent {
                    None => CgroupNode::new(ns.id, hs.id, "/".to_string(), None),
                    Some(parent_id) => {
                        let parent = nodes.get(&parent_id).ok_or(Errno::EINVAL)?;
                        let path = if parent.path == "/" {
                            format!("/{}", ns.name)
                        } else {
                            format!("{}/{}", parent.path, ns.name)
                        };
                        let node =
                            CgroupNode::new(ns.id, hs.id, path, Some(Arc::downgrade(parent)));
                        parent
                            .children
                            .lock()
                            .insert(ns.name.clone(), Arc::clone(&node));
                        node
                    }
                };
                if ns.parent.is_none() {
                    root = Some(Arc::clone(&node));
                }
                state.cgroups.insert(ns.id, Arc::downgrade(&node));
                nodes.insert(ns.id, node);
            }
            let root = root.ok_or(Errno::EINVAL)?;
            for controller in &hs.controllers {
                state.by_controller.insert(controller.clone(), hs.id);
            }
            state.hierarchies.insert(
                hs.id,
                Arc::new(Hierarchy {
                    id: hs.id,
                    name: hs.name.clone(),
                    controllers: hs.controllers.iter().cloned().collect(),
                    root,
                }),
            );
        }
        Ok(Self {
            state: Mutex::new(state),
        })
    }
}

impl fmt::Debug for CgroupRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CgroupRegistry")
            .field("hierarchies", &self.state.lock().hierarchies.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_controller_bound_once() {
        let registry = CgroupRegistry::new();
        registry.register("cpu", &["cpu", "cpuacct"]).unwrap();
        assert_eq!(registry.register("acct", &["cpuacct"]).err(), Some(Errno::EBUSY));
        assert!(registry.register("memory", &["memory"]).is_ok());
        assert_eq!(registry.root_cgroups().len(), 2);
    }

    #[test]
    fn test_children() {
        let registry = CgroupRegistry::new();
        let h = registry.register("pids", &["pids"]).unwrap();
        let a = registry.create_child(h.root(), "a").unwrap();
        let b = registry.create_child(&a, "b").unwrap();
        assert_eq!(b.path(), "/a/b");
        assert_eq!(registry.create_child(h.root(), "a").err(), Some(Errno::EEXIST));
        assert_eq!(registry.cgroup(b.id()).map(|n| n.path().to_string()), Some("/a/b".into()));
        assert_eq!(registry.remove_child(&a).err(), Some(Errno::EBUSY));
        registry.remove_child(&b).unwrap();
        registry.remove_child(&a).unwrap();
        assert!(h.root().children().is_empty());
    }

    #[test]
    fn test_membership() {
        let registry = CgroupRegistry::new();
        let h = registry.register("pids", &["pids"]).unwrap();
        h.root().enter(TaskKey(1));
        h.root().enter(TaskKey(2));
        assert_eq!(h.root().member_count(), 2);
        h.root().leave(TaskKey(1));
        assert_eq!(h.root().members(), vec![TaskKey(2)]);
    }

    #[test]
    #[should_panic(expected = "entered")]
    fn test_double_enter_panics() {
        let registry = CgroupRegistry::new();
        let h = registry.register("pids", &["pids"]).unwrap();
        h.root().enter(TaskKey(1));
        h.root().enter(TaskKey(1));
    }

    #[test]
    fn test_unregister_frees_controllers() {
        let registry = CgroupRegistry::new();
        let h = registry.register("pids", &["pids"]).unwrap();
        registry.unregister(h.id()).unwrap();
        assert!(registry.hierarchy_for_controller("pids").is_none());
        assert!(registry.register("pids", &["pids"]).is_ok());
    }

    #[test]
    fn test_snapshot_restore() {
        let registry = CgroupRegistry::new();
        let h = registry.register("cpu", &["cpu"]).unwrap();
        let a = registry.create_child(h.root(), "a").unwrap();
        registry.create_child(&a, "x").unwrap();
        registry.create_child(h.root(), "b").unwrap();
        let snap = registry.snapshot();
        let restored = CgroupRegistry::from_snapshot(&snap).unwrap();
        assert_eq!(restored.snapshot(), snap);
        let rh = restored.hierarchy_for_controller("cpu").unwrap();
        assert_eq!(rh.root().child("a").and_then(|a| a.child("x")).map(|x| x.path().to_string()), Some("/a/x".into()));
    }
}
