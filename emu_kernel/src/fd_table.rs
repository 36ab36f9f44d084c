//! File descriptor tables

use core_types::{Errno, FileId};
use kernel_api::FileDescription;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct FdEntry {
    pub file: Arc<dyn FileDescription>,
    pub close_on_exec: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FdTableSnapshot {
    pub uid: u64,
    /// `(fd, file, close_on_exec)`, ordered by descriptor
    pub entries: Vec<(i32, FileId, bool)>,
}

/// Maps descriptor numbers to open files; may be shared by several tasks
pub struct FdTable {
    uid: u64,
    table: Mutex<BTreeMap<i32, FdEntry>>,
}

impl FdTable {
    pub fn new(uid: u64) -> Arc<Self> {
        Arc::new(Self {
            uid,
            table: Mutex::new(BTreeMap::new()),
        })
    }

    pub fn uid(&self) -> u64 {
        self.uid
    }

    /// Installs `file` at the lowest free descriptor not below `min`
    ///
    /// Fails with EMFILE when no descriptor below `limit` is free.
    pub fn new_fd(
        &self,
        file: Arc<dyn FileDescription>,
        min: i32,
        close_on_exec: bool,
        limit: i32,
    ) -> Result<i32, Errno> {
        if min < 0 {
            return Err(Errno::EINVAL);
        }
        let mut table = self.table.lock();
        let mut fd = min;
        for &used in table.range(min..).map(|(k, _)| k) {
            if used != fd {
                break;
            }
            fd += 1;
        }
        if fd >= limit {
            return Err(Errno::EMFILE);
        }
        table.insert(fd, FdEntry { file, close_on_exec });
        Ok(fd)
    }

    /// Installs `file` at exactly `fd`, replacing any previous file
    pub fn set_at(
        &self,
        fd: i32,
        file: Arc<dyn FileDescription>,
        close_on_exec: bool,
        limit: i32,
    ) -> Result<Option<Arc<dyn FileDescription>>, Errno> {
        if fd < 0 {
            return Err(Errno::EINVAL);
        }
        if fd >= limit {
            return Err(Errno::EMFILE);
        }
        let old = self.table.lock().insert(fd, FdEntry { file, close_on_exec });
        Ok(old.map(|e| e.file))
    }

    pub fn get(&self, fd: i32) -> Option<Arc<dyn FileDescription>> {
        self.table.lock().get(&fd).map(|e| Arc::clone(&e.file))
    }

    pub fn remove(&self, fd: i32) -> Option<Arc<dyn FileDescription>> {
        self.table.lock().remove(&fd).map(|e| e.file)
    }

    pub fn len(&self) -> usize {
        self.table.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.lock().is_empty()
    }

    /// Drops every descriptor marked close-on-exec
    pub fn remove_close_on_exec(&self) {
        self.table.lock().retain(|_, e| !e.close_on_exec);
    }

    /// Open files, in descriptor order
    pub fn files(&self) -> Vec<Arc<dyn FileDescription>> {
        self.table
            .lock()
            .values()
            .map(|e| Arc::clone(&e.file))
            .collect()
    }

    /// Copies the table, as for fork(2) without CLONE_FILES
    pub fn fork(&self, uid: u64) -> Arc<Self> {
        Arc::new(Self {
            uid,
            table: Mutex::new(self.table.lock().clone()),
        })
    }

    pub fn snapshot(&self) -> FdTableSnapshot {
        FdTableSnapshot {
            uid: self.uid,
            entries: self
                .table
                .lock()
                .iter()
                .map(|(fd, e)| (*fd, e.file.id(), e.close_on_exec))
                .collect(),
        }
    }

    /// Rebuilds a table; `open` returns the reopened file for an ID
    pub fn from_snapshot<E>(
        snapshot: &FdTableSnapshot,
        mut open: impl FnMut(FileId) -> Result<Arc<dyn FileDescription>, E>,
    ) -> Result<Arc<Self>, E> {
        let mut table = BTreeMap::new();
        for (fd, id, close_on_exec) in &snapshot.entries {
            table.insert(
                *fd,
                FdEntry {
                    file: open(*id)?,
                    close_on_exec: *close_on_exec,
                },
            );
        }
        Ok(Arc::new(Self {
            uid: snapshot.uid,
            table: Mutex::new(table),
        }))
    }
}

impl fmt::Debug for FdTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FdTable")
            .field("uid", &self.uid)
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::FakeFile;

    #[test]
    fn test_lowest_free_descriptor() {
        let table = FdTable::new(1);
        assert_eq!(table.new_fd(FakeFile::new(1, "a"), 0, false, 10), Ok(0));
        assert_eq!(table.new_fd(FakeFile::new(2, "b"), 0, false, 10), Ok(1));
        table.remove(0);
        assert_eq!(table.new_fd(FakeFile::new(3, "c"), 0, false, 10), Ok(0));
        assert_eq!(table.new_fd(FakeFile::new(4, "d"), 5, false, 10), Ok(5));
    }

    #[test]
    fn test_limit_reached() {
        let table = FdTable::new(1);
        table.new_fd(FakeFile::new(1, "a"), 0, false, 1).unwrap();
        assert_eq!(
            table.new_fd(FakeFile::new(2, "b"), 0, false, 1),
            Err(Errno::EMFILE)
        );
    }

    #[test]
    fn test_close_on_exec() {
        let table = FdTable::new(1);
        table.new_fd(FakeFile::new(1, "keep"), 0, false, 10).unwrap();
        table.new_fd(FakeFile::new(2, "drop"), 0, true, 10).unwrap();
        table.remove_close_on_exec();
        assert_eq!(table.len(), 1);
        assert_eq!(table.get(0).map(|f| f.id()), Some(FileId(1)));
    }

    #[test]
    fn test_fork_is_independent() {
        let table = FdTable::new(1);
        table.new_fd(FakeFile::new(1, "a"), 0, false, 10).unwrap();
        let child = table.fork(2);
        child.remove(0);
        assert_eq!(table.len(), 1);
        assert!(child.is_empty());
        assert_eq!(child.uid(), 2);
    }

    #[test]
    fn test_snapshot_restore() {
        let table = FdTable::new(3);
        table.new_fd(FakeFile::new(8, "a"), 4, true, 10).unwrap();
        let snap = table.snapshot();
        assert_eq!(snap.entries, vec![(4, FileId(8), true)]);
        let restored = FdTable::from_snapshot(&snap, |id| {
            Ok::<_, ()>(FakeFile::new(id.0, "restored") as Arc<dyn FileDescription>)
        })
        .unwrap();
        assert_eq!(restored.snapshot(), snap);
    }
}
