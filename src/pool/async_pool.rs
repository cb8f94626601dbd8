//! Round-robin pool for protocols that allow multiplexing many requests over
//! one connection. Connection identity is already a stable `ConnectionId`, so
//! the live set is a plain `Vec` published through `arc_swap::ArcSwap`:
//! readers get a lock-free atomically published immutable array, writers
//! serialize on a mutex.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use dashmap::DashMap;
use parking_lot::Mutex;

use crate::connection::Connection;
use crate::pool::ConnectionPool;
use crate::request::ConnectionId;

pub struct AsyncPool {
    // The write path (register/destroy) serializes here; the snapshot in
    // `live` is rebuilt from this list under the same lock.
    write_lock: Mutex<Vec<Connection>>,
    live: ArcSwap<Vec<Connection>>,
    next: AtomicUsize,
    /// Per-connection in-flight counters, consulted by `try_acquire` only
    /// when `max_in_flight` is set. Entries exist for every registered
    /// connection regardless of whether a cap is configured, so `release`
    /// always has somewhere to decrement.
    in_flight: DashMap<ConnectionId, AtomicUsize>,
    max_in_flight: Option<usize>,
}

impl Default for AsyncPool {
    fn default() -> Self {
        AsyncPool::with_max_in_flight(None)
    }
}

impl AsyncPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a pool that caps how many requests may be in flight on a
    /// single connection at once; `None` is unlimited (the classic
    /// round-robin-only behavior).
    pub fn with_max_in_flight(max_in_flight: Option<usize>) -> Self {
        AsyncPool {
            write_lock: Mutex::new(Vec::new()),
            live: ArcSwap::from_pointee(Vec::new()),
            next: AtomicUsize::new(0),
            in_flight: DashMap::new(),
            max_in_flight,
        }
    }
}

impl ConnectionPool for AsyncPool {
    fn register(&self, connection: Connection) {
        self.in_flight.entry(connection.id()).or_insert_with(|| AtomicUsize::new(0));
        let mut connections = self.write_lock.lock();
        connections.push(connection);
        self.live.store(Arc::new(connections.clone()));
    }

    fn try_acquire(&self) -> Option<Connection> {
        let snapshot = self.live.load();
        let len = snapshot.len();
        if len == 0 {
            return None;
        }
        // Masking with 0x7fffffff keeps the counter well-defined even after
        // billions of acquisitions; wrap-around only ever changes which
        // connection is "next", never correctness.
        let start = self.next.fetch_add(1, Ordering::Relaxed) & 0x7fff_ffff;
        for offset in 0..len {
            let candidate = &snapshot[(start + offset) % len];
            if self.try_reserve(candidate.id()) {
                return Some(candidate.clone());
            }
        }
        // Every live connection is already at `max_in_flight`.
        None
    }

    /// Decrements the acquired connection's in-flight counter so a future
    /// `try_acquire` can route to it again. A no-op (modulo the bookkeeping
    /// above) when no cap is configured: the connection was never actually
    /// taken out of rotation in the first place.
    fn release(&self, connection: &Connection) {
        if let Some(counter) = self.in_flight.get(&connection.id()) {
            counter.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(1))).ok();
        }
    }

    fn destroy(&self, connection_id: ConnectionId) {
        self.in_flight.remove(&connection_id);
        let mut connections = self.write_lock.lock();
        let before = connections.len();
        connections.retain(|c| c.id() != connection_id);
        if connections.len() != before {
            self.live.store(Arc::new(connections.clone()));
        }
    }

    fn len(&self) -> usize {
        self.live.load().len()
    }
}

impl AsyncPool {
    /// Attempts to claim one in-flight slot on `connection_id`. Always
    /// succeeds when no cap is configured (or the connection's counter entry
    /// is missing, which shouldn't happen for a registered connection but is
    /// treated permissively rather than panicking).
    fn try_reserve(&self, connection_id: ConnectionId) -> bool {
        let Some(max) = self.max_in_flight else {
            return true;
        };
        match self.in_flight.get(&connection_id) {
            Some(counter) => counter
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| if n < max { Some(n + 1) } else { None })
                .is_ok(),
            None => true,
        }
    }
}
