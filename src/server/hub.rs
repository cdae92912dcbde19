use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use crate::data::{Presence, UserId};
use crate::protocol::{ServerEvent, UserStatus};

pub type ConnId = u64;

/// Presence and fan-out hub. One live connection per user; pushing to a user
/// who is offline is a silent no-op. Delivery never blocks: every connection
/// has an unbounded outbox drained by its own writer task.
#[derive(Clone)]
pub struct Hub {
    inner: Arc<Mutex<Inner>>,
}

struct Inner {
    next_conn_id: ConnId,
    conns: HashMap<UserId, Conn>,
}

struct Conn {
    id: ConnId,
    status: Presence,
    outbox: mpsc::UnboundedSender<ServerEvent>,
}

impl Hub {
    pub fn new() -> Hub {
        Hub {
            inner: Arc::new(Mutex::new(Inner {
                next_conn_id: 1,
                conns: HashMap::new(),
            })),
        }
    }

    /// Register a connection for a user, replacing any existing one. The old
    /// connection's outbox is dropped, which tells its writer task to hang up.
    pub fn add_connection(
        &self,
        user: UserId,
    ) -> (ConnId, mpsc::UnboundedReceiver<ServerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_conn_id;
        inner.next_conn_id += 1;
        inner.conns.insert(
            user,
            Conn {
                id,
                status: Presence::Online,
                outbox: tx,
            },
        );
        Self::push_status(&inner, user, Presence::Online);
        (id, rx)
    }

    /// Drop a user's connection, but only if `conn_id` still names the live
    /// one. A stale id means the user already reconnected; leave that alone.
    pub fn remove(&self, user: UserId, conn_id: ConnId) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.conns.get(&user) {
            Some(conn) if conn.id == conn_id => {
                inner.conns.remove(&user);
                Self::push_status(&inner, user, Presence::Offline);
                true
            }
            _ => false,
        }
    }

    pub fn is_connected(&self, user: UserId) -> bool {
        self.inner.lock().unwrap().conns.contains_key(&user)
    }

    pub fn set_status(&self, user: UserId, status: Presence) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(conn) = inner.conns.get_mut(&user) {
            if conn.status == status {
                return;
            }
            conn.status = status;
            Self::push_status(&inner, user, status);
        }
    }

    pub fn emit_to_user(&self, user: UserId, event: ServerEvent) {
        let inner = self.inner.lock().unwrap();
        if let Some(conn) = inner.conns.get(&user) {
            let _ = conn.outbox.send(event);
        }
    }

    pub fn broadcast(&self, event: ServerEvent) {
        let inner = self.inner.lock().unwrap();
        for conn in inner.conns.values() {
            let _ = conn.outbox.send(event.clone());
        }
    }

    fn push_status(inner: &Inner, user: UserId, status: Presence) {
        let event = ServerEvent::UserStatusesUpdated {
            statuses: vec![UserStatus {
                user_id: user,
                status,
            }],
        };
        for conn in inner.conns.values() {
            let _ = conn.outbox.send(event.clone());
        }
    }
}
