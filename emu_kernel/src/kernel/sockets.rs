//! The system-wide socket table

use super::Kernel;
use kernel_api::FileDescription;
use std::fmt;
use std::sync::{Arc, Weak};

/// An entry of the socket table
///
/// The table does not keep the socket open; owners remove their entry
/// with [`Kernel::delete_socket`] when the file is torn down.
#[derive(Clone)]
pub struct SocketRecord {
    /// Table entry number, in registration order
    pub id: u64,
    pub sock: Weak<dyn FileDescription>,
}

impl SocketRecord {
    /// The socket, if it is still open
    pub fn socket(&self) -> Option<Arc<dyn FileDescription>> {
        self.sock.upgrade()
    }
}

impl fmt::Debug for SocketRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketRecord")
            .field("id", &self.id)
            .field("open", &(self.sock.strong_count() > 0))
            .finish()
    }
}

impl Kernel {
    /// Adds `sock` to the socket table
    ///
    /// # Panics
    ///
    /// Panics if the socket is already recorded.
    pub fn record_socket(&self, sock: &Arc<dyn FileDescription>) {
        let _extern = self.lock_external();
        let mut inner = self.inner();
        let key = sock.id();
        if inner.sockets.contains_key(&key) {
            panic!("Socket {} added twice", key);
        }
        let id = inner.next_socket_id;
        inner.next_socket_id += 1;
        inner.sockets.insert(
            key,
            SocketRecord {
                id,
                sock: Arc::downgrade(sock),
            },
        );
    }

    pub fn delete_socket(&self, sock: &dyn FileDescription) {
        let _extern = self.lock_external();
        self.inner().sockets.remove(&sock.id());
    }

    /// Every recorded socket, in registration order
    pub fn list_sockets(&self) -> Vec<SocketRecord> {
        let _extern = self.lock_external();
        let mut records: Vec<SocketRecord> = self.inner().sockets.values().cloned().collect();
        records.sort_by_key(|r| r.id);
        records
    }
}
