//! Per-replica registry of live sockets. The store only ever sees a flag and
//! a gateway id; the socket objects themselves live here, owned by their
//! tasks and reachable only through their mailboxes.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

use crate::bus::mailbox::{Frame, Mailbox};
use crate::ws::events;

pub struct SocketHandle {
    pub session_id: String,
    pub user_id: String,
    pub mailbox: Mailbox,
}

pub struct SocketRegistry {
    sockets: DashMap<u64, SocketHandle>,
    next_id: AtomicU64,
}

impl SocketRegistry {
    pub fn new() -> Self {
        Self {
            sockets: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn register(&self, handle: SocketHandle) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.sockets.insert(id, handle);
        id
    }

    pub fn deregister(&self, id: u64) {
        self.sockets.remove(&id);
    }

    pub fn len(&self) -> usize {
        self.sockets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sockets.is_empty()
    }

    /// Phase one of shutdown: every local socket gets a `server_shutdown`
    /// lifecycle frame and drains.
    pub fn broadcast_shutdown(&self) {
        let payload = events::server_shutdown().to_string();
        for entry in self.sockets.iter() {
            entry.value().mailbox.push(Frame::critical(payload.clone()));
        }
    }
}

impl Default for SocketRegistry {
    fn default() -> Self {
        Self::new()
    }
}
