//! Connection pools: two interchangeable strategies behind one contract. One
//! pool hands out round-robin access to a rotating set of multiplexed
//! connections; the other hands out exclusive ownership of one connection at
//! a time. A trait covers the shared contract, and a tagged [`Pool`] enum
//! picks between the two implementations once at client construction, from
//! `Protocol::is_async`.

mod async_pool;
mod sync_pool;

pub use async_pool::AsyncPool;
pub use sync_pool::SyncPool;

use crate::connection::Connection;
use crate::request::ConnectionId;

/// The contract both pool strategies implement: `register` makes a
/// connection eligible for acquisition, `try_acquire` hands one out,
/// `release` returns it (a no-op for the async pool), and `destroy` removes
/// it permanently.
pub trait ConnectionPool: Send + Sync {
    fn register(&self, connection: Connection);
    fn try_acquire(&self) -> Option<Connection>;
    fn release(&self, connection: &Connection);
    fn destroy(&self, connection_id: ConnectionId);
    /// Number of connections currently registered (idle or not). Used for
    /// diagnostics and by round-robin fairness tests.
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The pool strategy selected at client construction, per `Protocol::is_async`.
pub enum Pool {
    Async(AsyncPool),
    Sync(SyncPool),
}

impl Pool {
    pub fn new(is_async: bool, max_in_flight_per_connection: Option<usize>) -> Self {
        if is_async {
            Pool::Async(AsyncPool::with_max_in_flight(max_in_flight_per_connection))
        } else {
            Pool::Sync(SyncPool::new())
        }
    }
}

impl ConnectionPool for Pool {
    fn register(&self, connection: Connection) {
        match self {
            Pool::Async(p) => p.register(connection),
            Pool::Sync(p) => p.register(connection),
        }
    }

    fn try_acquire(&self) -> Option<Connection> {
        match self {
            Pool::Async(p) => p.try_acquire(),
            Pool::Sync(p) => p.try_acquire(),
        }
    }

    fn release(&self, connection: &Connection) {
        match self {
            Pool::Async(p) => p.release(connection),
            Pool::Sync(p) => p.release(connection),
        }
    }

    fn destroy(&self, connection_id: ConnectionId) {
        match self {
            Pool::Async(p) => p.destroy(connection_id),
            Pool::Sync(p) => p.destroy(connection_id),
        }
    }

    fn len(&self) -> usize {
        match self {
            Pool::Async(p) => p.len(),
            Pool::Sync(p) => p.len(),
        }
    }
}
