//! Stack-based exclusive-acquire pool for protocols that allow only one
//! outstanding request per connection at a time: acquiring a connection
//! removes it from circulation until released. The id→connection map uses
//! `dashmap`, matching the registry's lock-free-map choice; the idle stack is
//! a `parking_lot::Mutex<Vec<_>>`, since LIFO push/pop under a short critical
//! section is simpler than a lock-free stack and nothing here needs more.

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::connection::Connection;
use crate::pool::ConnectionPool;
use crate::request::ConnectionId;

pub struct SyncPool {
    connections: DashMap<ConnectionId, Connection>,
    idle: Mutex<Vec<ConnectionId>>,
}

impl Default for SyncPool {
    fn default() -> Self {
        SyncPool {
            connections: DashMap::new(),
            idle: Mutex::new(Vec::new()),
        }
    }
}

impl SyncPool {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ConnectionPool for SyncPool {
    fn register(&self, connection: Connection) {
        let id = connection.id();
        self.connections.insert(id, connection);
        self.idle.lock().push(id);
    }

    /// Pops the idle stack, skipping entries that `destroy` already
    /// tombstoned out of `connections` rather than treating a stale pop as an
    /// error.
    fn try_acquire(&self) -> Option<Connection> {
        loop {
            let id = self.idle.lock().pop()?;
            if let Some(entry) = self.connections.get(&id) {
                return Some(entry.clone());
            }
            // Stale tombstone: the connection was destroyed while idle on the
            // stack. Discard and keep popping.
        }
    }

    fn release(&self, connection: &Connection) {
        // Only re-push if the connection is still registered; a connection
        // destroyed while on loan must not re-enter circulation.
        if self.connections.contains_key(&connection.id()) {
            self.idle.lock().push(connection.id());
        }
    }

    fn destroy(&self, connection_id: ConnectionId) {
        self.connections.remove(&connection_id);
        // The matching stack entry, if any, is left in place and filtered out
        // lazily by `try_acquire`.
    }

    fn len(&self) -> usize {
        self.connections.len()
    }
}
