//! A registered remote endpoint and the init hook run once its connection
//! comes up.
//!
//! Grounded on the teacher's plain `addr: SocketAddr` field on `Connection`
//! (`rpc.rs`) plus the named-server concept implicit in `rpc/master.rs`
//! (Kudu masters are addressed by name in a replicated set); generalized here
//! from "the Kudu master quorum" to "any named remote node", since the core
//! is protocol-agnostic.

use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicI32, Ordering};

use crate::connection::Connection;
use crate::error::Error;

/// Client-wide monotonic node id.
pub type NodeId = i32;

static NEXT_NODE_ID: AtomicI32 = AtomicI32::new(1);

/// Allocates the next process-wide unique node id.
pub fn next_node_id() -> NodeId {
    NEXT_NODE_ID.fetch_add(1, Ordering::Relaxed)
}

/// A per-node initialization hook run against a freshly connected socket
/// before it is published to the pool (e.g. a handshake or auth exchange).
/// Boxed because each registered node may supply a distinct closure.
pub type InitFunc =
    Box<dyn Fn(Connection) -> Pin<Box<dyn Future<Output = Result<(), Error>> + Send>> + Send + Sync>;

/// A named remote endpoint registered with the endpoint manager.
///
/// A node is *active* for exactly as long as it is present in the manager's
/// node map (spec §3); removing it from that map is what makes
/// `UnregisterEndpoint` synchronously effective, even while a connect attempt
/// is in flight (the connect loop re-checks node activity at each step).
pub struct Node {
    pub id: NodeId,
    pub name: String,
    pub remote_endpoint: SocketAddr,
    pub init_func: Option<InitFunc>,
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("remote_endpoint", &self.remote_endpoint)
            .field("has_init_func", &self.init_func.is_some())
            .finish()
    }
}

impl Node {
    pub fn new(name: impl Into<String>, remote_endpoint: SocketAddr, init_func: Option<InitFunc>) -> Self {
        Node {
            id: next_node_id(),
            name: name.into(),
            remote_endpoint,
            init_func,
        }
    }
}
