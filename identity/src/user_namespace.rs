//! User namespaces
//!
//! A user namespace maps the user and group IDs seen inside it onto the IDs
//! of its parent. Mapping through every ancestor yields the kernel-global
//! [`Kuid`]/[`Kgid`].

use core_types::{Errno, Kgid, Kuid};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// One contiguous range of an ID map
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdMapEntry {
    /// First ID in this namespace
    pub first_id: u32,
    /// First ID in the parent namespace
    pub first_parent_id: u32,
    /// Number of IDs in the range
    pub length: u32,
}

impl IdMapEntry {
    fn map_to_parent(&self, id: u32) -> Option<u32> {
        let offset = id.checked_sub(self.first_id)?;
        if offset >= self.length {
            return None;
        }
        self.first_parent_id.checked_add(offset)
    }

    fn map_from_parent(&self, id: u32) -> Option<u32> {
        let offset = id.checked_sub(self.first_parent_id)?;
        if offset >= self.length {
            return None;
        }
        self.first_id.checked_add(offset)
    }
}

#[derive(Debug, Default, Clone)]
struct IdMaps {
    uid_map: Vec<IdMapEntry>,
    gid_map: Vec<IdMapEntry>,
}

fn uid_map(maps: &IdMaps) -> &[IdMapEntry] {
    &maps.uid_map
}

fn gid_map(maps: &IdMaps) -> &[IdMapEntry] {
    &maps.gid_map
}

/// Serialized form of a [`UserNamespace`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserNamespaceSnapshot {
    pub id: u64,
    pub parent: Option<u64>,
    pub owner: Kuid,
    pub uid_map: Vec<IdMapEntry>,
    pub gid_map: Vec<IdMapEntry>,
}

/// A user namespace
pub struct UserNamespace {
    id: u64,
    parent: Option<Arc<UserNamespace>>,
    owner: Kuid,
    maps: RwLock<IdMaps>,
}

impl UserNamespace {
    /// ID of the root user namespace
    pub const ROOT_ID: u64 = 0;

    /// Creates the root user namespace, whose maps are the identity
    pub fn new_root() -> Arc<Self> {
        let full = IdMapEntry {
            first_id: 0,
            first_parent_id: 0,
            length: u32::MAX,
        };
        Arc::new(Self {
            id: Self::ROOT_ID,
            parent: None,
            owner: Kuid::ROOT,
            maps: RwLock::new(IdMaps {
                uid_map: vec![full],
                gid_map: vec![full],
            }),
        })
    }

    /// Creates a child namespace owned by `owner` with empty ID maps
    pub fn new_child(self: &Arc<Self>, id: u64, owner: Kuid) -> Arc<Self> {
        Arc::new(Self {
            id,
            parent: Some(Arc::clone(self)),
            owner,
            maps: RwLock::new(IdMaps::default()),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn parent(&self) -> Option<&Arc<UserNamespace>> {
        self.parent.as_ref()
    }

    pub fn owner(&self) -> Kuid {
        self.owner
    }

    /// Returns the root of the namespace tree containing `self`
    pub fn root(self: &Arc<Self>) -> Arc<UserNamespace> {
        let mut ns = Arc::clone(self);
        while let Some(parent) = ns.parent.clone() {
            ns = parent;
        }
        ns
    }

    /// Number of ancestors
    pub fn depth(&self) -> usize {
        let mut depth = 0;
        let mut ns = self.parent.as_ref();
        while let Some(parent) = ns {
            depth += 1;
            ns = parent.parent.as_ref();
        }
        depth
    }

    /// Installs the UID map; a map can be written only once
    pub fn set_uid_map(&self, entries: Vec<IdMapEntry>) -> Result<(), Errno> {
        let mut maps = self.maps.write();
        if !maps.uid_map.is_empty() {
            return Err(Errno::EPERM);
        }
        maps.uid_map = entries;
        Ok(())
    }

    /// Installs the GID map; a map can be written only once
    pub fn set_gid_map(&self, entries: Vec<IdMapEntry>) -> Result<(), Errno> {
        let mut maps = self.maps.write();
        if !maps.gid_map.is_empty() {
            return Err(Errno::EPERM);
        }
        maps.gid_map = entries;
        Ok(())
    }

    /// Maps a UID in this namespace to a kernel UID
    pub fn map_to_kuid(&self, uid: u32) -> Kuid {
        match self.map_up(uid, uid_map) {
            Some(id) => Kuid(id),
            None => Kuid::NO_ID,
        }
    }

    /// Maps a GID in this namespace to a kernel GID
    pub fn map_to_kgid(&self, gid: u32) -> Kgid {
        match self.map_up(gid, gid_map) {
            Some(id) => Kgid(id),
            None => Kgid::NO_ID,
        }
    }

    /// Maps a kernel UID to the UID seen in this namespace
    pub fn map_from_kuid(&self, kuid: Kuid) -> Option<u32> {
        self.map_down(kuid.0, uid_map)
    }

    /// Maps a kernel GID to the GID seen in this namespace
    pub fn map_from_kgid(&self, kgid: Kgid) -> Option<u32> {
        self.map_down(kgid.0, gid_map)
    }

    fn map_up(&self, id: u32, select: fn(&IdMaps) -> &[IdMapEntry]) -> Option<u32> {
        let mapped = {
            let maps = self.maps.read();
            select(&*maps).iter().find_map(|e| e.map_to_parent(id))?
        };
        match &self.parent {
            Some(parent) => parent.map_up(mapped, select),
            None => Some(mapped),
        }
    }

    fn map_down(&self, id: u32, select: fn(&IdMaps) -> &[IdMapEntry]) -> Option<u32> {
        let parent_id = match &self.parent {
            Some(parent) => parent.map_down(id, select)?,
            None => id,
        };
        let maps = self.maps.read();
        select(&*maps).iter().find_map(|e| e.map_from_parent(parent_id))
    }

    pub fn snapshot(&self) -> UserNamespaceSnapshot {
        let maps = self.maps.read();
        UserNamespaceSnapshot {
            id: self.id,
            parent: self.parent.as_ref().map(|p| p.id),
            owner: self.owner,
            uid_map: maps.uid_map.clone(),
            gid_map: maps.gid_map.clone(),
        }
    }

    /// Rebuilds a namespace; `parent` must be the namespace named by
    /// `snapshot.parent`
    pub fn from_snapshot(
        snapshot: &UserNamespaceSnapshot,
        parent: Option<Arc<UserNamespace>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: snapshot.id,
            parent,
            owner: snapshot.owner,
            maps: RwLock::new(IdMaps {
                uid_map: snapshot.uid_map.clone(),
                gid_map: snapshot.gid_map.clone(),
            }),
        })
    }
}

impl PartialEq for UserNamespace {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for UserNamespace {}

impl fmt::Debug for UserNamespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserNamespace")
            .field("id", &self.id)
            .field("owner", &self.owner)
            .field("depth", &self.depth())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_identity_mapping() {
        let root = UserNamespace::new_root();
        assert_eq!(root.map_to_kuid(1000), Kuid(1000));
        assert_eq!(root.map_from_kuid(Kuid(0)), Some(0));
        assert_eq!(root.depth(), 0);
    }

    #[test]
    fn test_child_mapping() {
        let root = UserNamespace::new_root();
        let child = root.new_child(7, Kuid(1000));
        assert_eq!(child.map_to_kuid(0), Kuid::NO_ID);
        child
            .set_uid_map(vec![IdMapEntry {
                first_id: 0,
                first_parent_id: 100_000,
                length: 65536,
            }])
            .unwrap();
        assert_eq!(child.map_to_kuid(0), Kuid(100_000));
        assert_eq!(child.map_to_kuid(70_000), Kuid::NO_ID);
        assert_eq!(child.map_from_kuid(Kuid(100_005)), Some(5));
        assert_eq!(child.map_from_kuid(Kuid(5)), None);
        assert_eq!(child.depth(), 1);
        assert_eq!(child.root().id(), UserNamespace::ROOT_ID);
    }

    #[test]
    fn test_map_written_once() {
        let root = UserNamespace::new_root();
        let child = root.new_child(3, Kuid(0));
        let entry = IdMapEntry {
            first_id: 0,
            first_parent_id: 0,
            length: 1,
        };
        child.set_gid_map(vec![entry]).unwrap();
        assert_eq!(child.set_gid_map(vec![entry]), Err(Errno::EPERM));
    }

    #[test]
    fn test_snapshot_round_trip() {
        let root = UserNamespace::new_root();
        let child = root.new_child(9, Kuid(5));
        child
            .set_uid_map(vec![IdMapEntry {
                first_id: 0,
                first_parent_id: 5,
                length: 1,
            }])
            .unwrap();
        let snap = child.snapshot();
        let restored = UserNamespace::from_snapshot(&snap, Some(root));
        assert_eq!(restored.snapshot(), snap);
        assert_eq!(restored.map_to_kuid(0), Kuid(5));
    }
}
