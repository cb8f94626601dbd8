//! The endpoint manager: owns the set of named remote nodes, and runs each
//! node's independent connect/reconnect loop. Generalizes "a single
//! connection resets itself after backoff" into "a manager owns N named
//! nodes and reconnects each of them independently". The node, name, and
//! connection maps sit behind a single `parking_lot::Mutex<State>`, per spec
//! §4.3/§5 ("mutated only under the manager's exclusive lock" / "a single
//! exclusive lock around both node/connection maps"): a coarse exclusive
//! lock is fine since registration and reconnect are both infrequent
//! compared to the request traffic flowing over the connections themselves,
//! and a single lock keeps operations that touch more than one map (e.g.
//! unregistering a node and tearing down its connection) atomic across all
//! of them.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};

use crate::backoff::{BackoffRange, COLD_CONNECT_BACKOFF, POST_DISCONNECT_BACKOFF};
use crate::connection::{Connection, ConnectionEvent, ConnectionOptions};
use crate::error::Error;
use crate::node::{InitFunc, Node, NodeId};
use crate::request::ConnectionId;

/// Endpoint-manager lifecycle events, consumed by the client façade to know
/// when a node's connection is safe to hand to the pool.
#[derive(Debug)]
pub enum EndpointEvent {
    /// Raised once per successful connect, before the connection is
    /// available in the pool.
    NodeConnected { node_id: NodeId, connection: Connection },
    /// Raised once `init_func` (if any) has resolved and the connection has
    /// been recorded against the node. The client should register the
    /// connection with the pool upon receiving this event.
    NodeAlreadyAvailable { node_id: NodeId, connection: Connection },
    /// Raised when a node's `init_func` rejects a freshly connected socket.
    /// The connection is already being torn down by the time this fires; the
    /// node's connect loop will back off and retry. Carries the same
    /// `Error::InitFailed` taxonomy surfaced to callers elsewhere.
    NodeInitFailed { node_id: NodeId, error: Error },
}

/// Per-node bookkeeping the connect loop needs beyond the `Node` record
/// itself: the currently-live connection id (if any) and a notifier the
/// client wakes when it observes that connection disconnecting.
struct NodeState {
    node: Arc<Node>,
    current_connection: Option<ConnectionId>,
    disconnect: Arc<Notify>,
}

/// Everything mutated together under one lock: which nodes are active, the
/// name→id index used to reject duplicate registrations, and which
/// connection (if any) currently serves each node.
#[derive(Default)]
struct State {
    nodes: HashMap<NodeId, NodeState>,
    names: HashMap<String, NodeId>,
    connections: HashMap<NodeId, Connection>,
}

impl State {
    fn is_active(&self, node_id: NodeId) -> bool {
        self.nodes.contains_key(&node_id)
    }
}

/// Owns node registration and drives each node's independent reconnect loop.
pub struct EndpointManager {
    state: Mutex<State>,
    connection_options: ConnectionOptions,
    cold_connect_backoff: BackoffRange,
    post_disconnect_backoff: BackoffRange,
    connection_events: mpsc::UnboundedSender<ConnectionEvent>,
    endpoint_events: mpsc::UnboundedSender<EndpointEvent>,
}

impl EndpointManager {
    /// Builds a manager that publishes low-level connection events on
    /// `connection_events` (shared across every connection this manager ever
    /// opens; the client reads from this to drive the send/receive state
    /// machine) and its own lifecycle events on a freshly created channel,
    /// whose receiver is returned alongside. Uses the default backoff
    /// windows; see [`EndpointManager::with_backoff`] to override them.
    pub fn new(
        connection_options: ConnectionOptions,
        connection_events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> (Arc<EndpointManager>, mpsc::UnboundedReceiver<EndpointEvent>) {
        Self::with_backoff(
            connection_options,
            COLD_CONNECT_BACKOFF,
            POST_DISCONNECT_BACKOFF,
            connection_events,
        )
    }

    /// Like [`EndpointManager::new`], but with caller-supplied reconnect
    /// backoff windows (`ClientConfig` plumbs these through so they're
    /// overridable by callers).
    pub fn with_backoff(
        connection_options: ConnectionOptions,
        cold_connect_backoff: BackoffRange,
        post_disconnect_backoff: BackoffRange,
        connection_events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> (Arc<EndpointManager>, mpsc::UnboundedReceiver<EndpointEvent>) {
        let (endpoint_events, endpoint_events_rx) = mpsc::unbounded_channel();
        let manager = Arc::new(EndpointManager {
            state: Mutex::new(State::default()),
            connection_options,
            cold_connect_backoff,
            post_disconnect_backoff,
            connection_events,
            endpoint_events,
        });
        (manager, endpoint_events_rx)
    }

    /// Registers a new node and spawns its connect loop. Returns `false`
    /// without side effect if a node with this name is already active.
    pub fn try_register_endpoint(
        self: &Arc<Self>,
        name: impl Into<String>,
        remote_endpoint: SocketAddr,
        init_func: Option<InitFunc>,
    ) -> bool {
        let name = name.into();
        let node = {
            let mut state = self.state.lock();
            if state.names.contains_key(&name) {
                return false;
            }
            let node = Arc::new(Node::new(name.clone(), remote_endpoint, init_func));
            state.names.insert(name, node.id);
            state.nodes.insert(
                node.id,
                NodeState {
                    node: node.clone(),
                    current_connection: None,
                    disconnect: Arc::new(Notify::new()),
                },
            );
            node
        };

        let manager = self.clone();
        tokio::spawn(async move {
            manager.connect_loop(node).await;
        });
        true
    }

    /// Removes a node from the active set and disconnects its connection, if
    /// any. Once this returns `true`, no further `NodeConnected`/
    /// `NodeAlreadyAvailable` event for that node id will fire: every
    /// checkpoint in `connect_loop` re-reads `is_active` before publishing
    /// anything. Name removal, node removal, and connection teardown happen
    /// under one lock acquisition so a concurrent `connect_loop` checkpoint
    /// never observes them half-applied.
    pub fn unregister_endpoint(&self, name: &str) -> bool {
        let (removed_state, connection) = {
            let mut state = self.state.lock();
            let node_id = match state.names.remove(name) {
                Some(id) => id,
                None => return false,
            };
            let removed_state = state.nodes.remove(&node_id);
            let connection = state.connections.remove(&node_id);
            (removed_state, connection)
        };
        if let Some(connection) = connection {
            connection.begin_disconnect();
        }
        // Wake the node's connect loop if it's parked waiting for a disconnect
        // notification (the only unbounded wait in `connect_loop`): once the
        // node is gone from `nodes`, `on_connection_lost` has no entry left to
        // notify through, so without this the loop would wait forever instead
        // of observing `is_active() == false` and exiting.
        if let Some(state) = removed_state {
            state.disconnect.notify_one();
        }
        true
    }

    pub fn get_all_registered_endpoints(&self) -> Vec<(String, SocketAddr)> {
        self.state
            .lock()
            .nodes
            .values()
            .map(|state| (state.node.name.clone(), state.node.remote_endpoint))
            .collect()
    }

    /// Called by the client façade when it observes `ConnectionEvent::Disconnected`
    /// for a connection this manager owns. Removes the stale map entry and
    /// wakes the owning connect loop so it can schedule a reconnect. A mismatched
    /// `connection_id` (an event for a connection this node has already moved
    /// past) is ignored.
    pub fn on_connection_lost(&self, node_id: NodeId, connection_id: ConnectionId) {
        let mut state = self.state.lock();
        state.connections.remove(&node_id);
        if let Some(node_state) = state.nodes.get_mut(&node_id) {
            if node_state.current_connection == Some(connection_id) {
                node_state.current_connection = None;
                node_state.disconnect.notify_one();
            }
        }
    }

    /// The per-node connect/reconnect loop.
    async fn connect_loop(self: Arc<Self>, node: Arc<Node>) {
        loop {
            if !self.state.lock().is_active(node.id) {
                return;
            }

            let connect_result = Connection::connect(
                node.remote_endpoint,
                self.connection_options.clone(),
                self.connection_events.clone(),
            )
            .await;

            let connection = match connect_result {
                Ok(connection) => connection,
                Err(err) => {
                    log::warn!(
                        "endpoint manager: connect to node {:?} ({}) failed: {}",
                        node.name,
                        node.remote_endpoint,
                        err
                    );
                    if !self.state.lock().is_active(node.id) {
                        return;
                    }
                    tokio::time::sleep(self.cold_connect_backoff.sample()).await;
                    continue;
                }
            };

            if !self.state.lock().is_active(node.id) {
                connection.begin_disconnect();
                return;
            }

            let disconnect_notify = {
                let mut state = self.state.lock();
                match state.nodes.get_mut(&node.id) {
                    Some(node_state) => {
                        node_state.current_connection = Some(connection.id());
                        node_state.disconnect.clone()
                    }
                    None => {
                        connection.begin_disconnect();
                        return;
                    }
                }
            };

            let _ = self.endpoint_events.send(EndpointEvent::NodeConnected {
                node_id: node.id,
                connection: connection.clone(),
            });

            let init_ok = match &node.init_func {
                None => true,
                Some(init_func) => match init_func(connection.clone()).await {
                    Ok(()) => true,
                    Err(err) => {
                        log::warn!(
                            "endpoint manager: init_func failed for node {:?}: {}",
                            node.name,
                            err
                        );
                        connection.begin_disconnect();
                        let error = Error::InitFailed {
                            name: node.name.clone(),
                            source: Box::new(err),
                        };
                        let _ = self
                            .endpoint_events
                            .send(EndpointEvent::NodeInitFailed { node_id: node.id, error });
                        false
                    }
                },
            };

            if init_ok {
                let still_active = {
                    let mut state = self.state.lock();
                    let active = state.is_active(node.id);
                    if active {
                        state.connections.insert(node.id, connection.clone());
                    }
                    active
                };
                if still_active {
                    let _ = self.endpoint_events.send(EndpointEvent::NodeAlreadyAvailable {
                        node_id: node.id,
                        connection: connection.clone(),
                    });
                } else {
                    connection.begin_disconnect();
                    return;
                }
            }

            // Wait for the client to report this connection's disconnect (it
            // observes `ConnectionEvent::Disconnected` and calls
            // `on_connection_lost`), then loop around to reconnect.
            disconnect_notify.notified().await;

            if !self.state.lock().is_active(node.id) {
                return;
            }
            tokio::time::sleep(self.post_disconnect_backoff.sample()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn duplicate_name_registration_is_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (conn_tx, _conn_rx) = mpsc::unbounded_channel();
        let (manager, _events_rx) = EndpointManager::new(ConnectionOptions::default(), conn_tx);

        assert!(manager.try_register_endpoint("a", addr, None));
        assert!(!manager.try_register_endpoint("a", addr, None));
    }

    #[tokio::test]
    async fn unregister_unknown_name_returns_false() {
        let (conn_tx, _conn_rx) = mpsc::unbounded_channel();
        let (manager, _events_rx) = EndpointManager::new(ConnectionOptions::default(), conn_tx);
        assert!(!manager.unregister_endpoint("missing"));
    }

    #[tokio::test]
    async fn get_all_registered_endpoints_reflects_registration() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (conn_tx, _conn_rx) = mpsc::unbounded_channel();
        let (manager, _events_rx) = EndpointManager::new(ConnectionOptions::default(), conn_tx);
        manager.try_register_endpoint("a", addr, None);
        let endpoints = manager.get_all_registered_endpoints();
        assert_eq!(endpoints, vec![("a".to_string(), addr)]);
    }
}
