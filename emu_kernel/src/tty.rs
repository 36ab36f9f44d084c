//! Terminals that can control a session

use crate::lock_order::{Level, Ordered};
use crate::thread_group::ThreadGroup;
use parking_lot::{Mutex, MutexGuard};
use std::fmt;
use std::sync::{Arc, Weak};

#[derive(Default)]
pub(crate) struct TtyState {
    /// The session leader controlled by this terminal
    pub(crate) tg: Option<Weak<ThreadGroup>>,
}

/// A terminal device, identified by its index
pub struct Tty {
    index: u32,
    state: Mutex<TtyState>,
}

impl Tty {
    pub fn new(index: u32) -> Arc<Self> {
        Arc::new(Self {
            index,
            state: Mutex::new(TtyState::default()),
        })
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub(crate) fn lock(&self) -> Ordered<MutexGuard<'_, TtyState>> {
        Ordered::acquire(Level::Tty, || self.state.lock())
    }

    /// The session leader this terminal controls, if any
    pub fn thread_group(&self) -> Option<Arc<ThreadGroup>> {
        self.lock().tg.as_ref().and_then(Weak::upgrade)
    }
}

impl fmt::Debug for Tty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tty").field("index", &self.index).finish()
    }
}
