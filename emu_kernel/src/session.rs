//! Sessions and process groups
//!
//! Membership is recorded on each thread group; a session or process group
//! lives in the task set for as long as some thread group refers to it.

use crate::thread_group::ThreadGroup;
use std::fmt;
use std::sync::{Arc, Weak};

pub struct Session {
    id: u64,
    leader: Weak<ThreadGroup>,
    leader_uid: u64,
}

impl Session {
    pub(crate) fn new(id: u64, leader: &Arc<ThreadGroup>) -> Arc<Self> {
        Arc::new(Self {
            id,
            leader: Arc::downgrade(leader),
            leader_uid: leader.uid(),
        })
    }

    pub(crate) fn restore(id: u64, leader: Weak<ThreadGroup>, leader_uid: u64) -> Arc<Self> {
        Arc::new(Self {
            id,
            leader,
            leader_uid,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// The thread group that created the session, while it is alive
    pub fn leader(&self) -> Option<Arc<ThreadGroup>> {
        self.leader.upgrade()
    }

    pub fn leader_uid(&self) -> u64 {
        self.leader_uid
    }

    pub fn is_leader(&self, tg: &ThreadGroup) -> bool {
        self.leader_uid == tg.uid()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("leader", &self.leader_uid)
            .finish()
    }
}

pub struct ProcessGroup {
    id: u64,
    originator: Weak<ThreadGroup>,
    originator_uid: u64,
    session: Arc<Session>,
}

impl ProcessGroup {
    pub(crate) fn new(id: u64, originator: &Arc<ThreadGroup>, session: Arc<Session>) -> Arc<Self> {
        Arc::new(Self {
            id,
            originator: Arc::downgrade(originator),
            originator_uid: originator.uid(),
            session,
        })
    }

    pub(crate) fn restore(
        id: u64,
        originator: Weak<ThreadGroup>,
        originator_uid: u64,
        session: Arc<Session>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            originator,
            originator_uid,
            session,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// The thread group whose ID the process group carries
    pub fn originator(&self) -> Option<Arc<ThreadGroup>> {
        self.originator.upgrade()
    }

    pub fn originator_uid(&self) -> u64 {
        self.originator_uid
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }
}

impl fmt::Debug for ProcessGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessGroup")
            .field("id", &self.id)
            .field("originator", &self.originator_uid)
            .field("session", &self.session.id)
            .finish()
    }
}
