//! PID namespaces
//!
//! A [`PidNamespace`] is an immutable handle; the IDs allocated in it live
//! in the task set and are guarded by the task set lock.

use core_types::{Errno, TaskKey, ThreadId};
use identity::UserNamespace;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

pub struct PidNamespace {
    id: u64,
    parent: Option<Arc<PidNamespace>>,
    user_ns: Arc<UserNamespace>,
    level: u32,
}

impl PidNamespace {
    pub fn new_root(id: u64, user_ns: Arc<UserNamespace>) -> Arc<Self> {
        Arc::new(Self {
            id,
            parent: None,
            user_ns,
            level: 0,
        })
    }

    pub fn new_child(self: &Arc<Self>, id: u64, user_ns: Arc<UserNamespace>) -> Arc<Self> {
        Arc::new(Self {
            id,
            parent: Some(Arc::clone(self)),
            user_ns,
            level: self.level + 1,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn parent(&self) -> Option<&Arc<PidNamespace>> {
        self.parent.as_ref()
    }

    pub fn user_namespace(&self) -> &Arc<UserNamespace> {
        &self.user_ns
    }

    /// Nesting depth; zero for the root
    pub fn level(&self) -> u32 {
        self.level
    }

    /// This namespace followed by its ancestors up to the root
    pub fn ancestry(self: &Arc<Self>) -> Vec<Arc<PidNamespace>> {
        let mut chain = vec![Arc::clone(self)];
        let mut ns = self.parent.as_ref();
        while let Some(parent) = ns {
            chain.push(Arc::clone(parent));
            ns = parent.parent.as_ref();
        }
        chain
    }

    /// Reports whether `self` is `other` or one of its ancestors
    pub fn is_ancestor_of(&self, other: &PidNamespace) -> bool {
        let mut ns = Some(other);
        while let Some(candidate) = ns {
            if candidate.id == self.id {
                return true;
            }
            ns = candidate.parent.as_deref();
        }
        false
    }
}

impl PartialEq for PidNamespace {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for PidNamespace {}

impl fmt::Debug for PidNamespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PidNamespace")
            .field("id", &self.id)
            .field("level", &self.level)
            .finish()
    }
}

/// IDs allocated in one PID namespace
#[derive(Debug, Default, Clone)]
pub(crate) struct PidNsState {
    pub(crate) last: i32,
    pub(crate) tids: BTreeMap<ThreadId, TaskKey>,
    pub(crate) task_ids: BTreeMap<TaskKey, ThreadId>,
    pub(crate) tgids: BTreeMap<u64, ThreadId>,
    pub(crate) tg_by_id: BTreeMap<ThreadId, u64>,
    pub(crate) pgids: BTreeMap<u64, ThreadId>,
    pub(crate) pg_by_id: BTreeMap<ThreadId, u64>,
    pub(crate) sids: BTreeMap<u64, ThreadId>,
    pub(crate) session_by_id: BTreeMap<ThreadId, u64>,
    /// Set once the namespace's init has exited
    pub(crate) exiting: bool,
}

impl PidNsState {
    fn in_use(&self, id: ThreadId) -> bool {
        self.tids.contains_key(&id)
            || self.tg_by_id.contains_key(&id)
            || self.pg_by_id.contains_key(&id)
            || self.session_by_id.contains_key(&id)
    }

    /// Allocates the next free ID after the last one handed out
    ///
    /// IDs stay below `limit` and wrap around to 2, since 1 belongs to
    /// init. Fails with ENOMEM once init has exited and EAGAIN when no ID
    /// is free.
    pub(crate) fn allocate(&mut self, limit: i32) -> Result<ThreadId, Errno> {
        if self.exiting {
            return Err(Errno::ENOMEM);
        }
        let mut id = self.last;
        for _ in 0..limit {
            id += 1;
            if id >= limit {
                id = ThreadId::INIT.0 + 1;
            }
            if !self.in_use(ThreadId(id)) {
                self.last = id;
                return Ok(ThreadId(id));
            }
        }
        Err(Errno::EAGAIN)
    }

    pub(crate) fn insert_task(&mut self, tid: ThreadId, key: TaskKey) {
        self.tids.insert(tid, key);
        self.task_ids.insert(key, tid);
    }

    pub(crate) fn remove_task(&mut self, key: TaskKey) -> Option<ThreadId> {
        let tid = self.task_ids.remove(&key)?;
        self.tids.remove(&tid);
        Some(tid)
    }

    pub(crate) fn insert_thread_group(&mut self, tg: u64, id: ThreadId) {
        self.tgids.insert(tg, id);
        self.tg_by_id.insert(id, tg);
    }

    pub(crate) fn remove_thread_group(&mut self, tg: u64) {
        if let Some(id) = self.tgids.remove(&tg) {
            self.tg_by_id.remove(&id);
        }
    }

    pub(crate) fn insert_process_group(&mut self, pg: u64, id: ThreadId) {
        self.pgids.insert(pg, id);
        self.pg_by_id.insert(id, pg);
    }

    pub(crate) fn remove_process_group(&mut self, pg: u64) {
        if let Some(id) = self.pgids.remove(&pg) {
            self.pg_by_id.remove(&id);
        }
    }

    pub(crate) fn insert_session(&mut self, session: u64, id: ThreadId) {
        self.sids.insert(session, id);
        self.session_by_id.insert(id, session);
    }

    pub(crate) fn remove_session(&mut self, session: u64) {
        if let Some(id) = self.sids.remove(&session) {
            self.session_by_id.remove(&id);
        }
    }

    pub(crate) fn snapshot(&self, ns: &PidNamespace) -> PidNamespaceSnapshot {
        PidNamespaceSnapshot {
            id: ns.id,
            parent: ns.parent.as_ref().map(|p| p.id),
            user_namespace: ns.user_ns.id(),
            last: self.last,
            exiting: self.exiting,
            tids: self.tids.iter().map(|(id, key)| (*id, *key)).collect(),
            tgids: self.tgids.iter().map(|(tg, id)| (*tg, *id)).collect(),
            pgids: self.pgids.iter().map(|(pg, id)| (*pg, *id)).collect(),
            sids: self.sids.iter().map(|(s, id)| (*s, *id)).collect(),
        }
    }

    pub(crate) fn from_snapshot(snapshot: &PidNamespaceSnapshot) -> Self {
        let mut state = PidNsState {
            last: snapshot.last,
            exiting: snapshot.exiting,
            ..PidNsState::default()
        };
        for (id, key) in &snapshot.tids {
            state.insert_task(*id, *key);
        }
        for (tg, id) in &snapshot.tgids {
            state.insert_thread_group(*tg, *id);
        }
        for (pg, id) in &snapshot.pgids {
            state.insert_process_group(*pg, *id);
        }
        for (s, id) in &snapshot.sids {
            state.insert_session(*s, *id);
        }
        state
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PidNamespaceSnapshot {
    pub id: u64,
    pub parent: Option<u64>,
    pub user_namespace: u64,
    pub last: i32,
    pub exiting: bool,
    pub tids: Vec<(ThreadId, TaskKey)>,
    pub tgids: Vec<(u64, ThreadId)>,
    pub pgids: Vec<(u64, ThreadId)>,
    pub sids: Vec<(u64, ThreadId)>,
}
