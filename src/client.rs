//! The client façade: owns the pool, endpoint manager, pending-send queue and
//! receiving registry, and implements the send/receive/retry state machine of
//! spec §4.1.
//!
//! Grounded on `rpc.rs::Messenger`/`ConnectionManager` (a `Sender<Command>`
//! mailbox plus a background event-loop thread that owns every connection),
//! modernized to a tokio-task-per-connection model where the single event
//! loop task here plays the role of the teacher's event loop thread, reacting
//! to a merged stream of connection and endpoint-manager events instead of
//! polling an mio `Poll`. The mpsc-channel mediation between components
//! follows the request/fulfillment idiom of
//! `mongodb-mongo-rust-driver::cmap::connection_requester` (retrieved in
//! `other_examples/`), and sidesteps the teacher's cyclic
//! pool/manager/queue/client object graph per the REDESIGN note in spec §9.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::mpsc;

use crate::config::ClientConfig;
use crate::connection::{Connection, ConnectionEvent};
use crate::endpoint::{EndpointEvent, EndpointManager};
use crate::error::Error;
use crate::node::{InitFunc, NodeId};
use crate::pending::PendingQueue;
use crate::pool::{ConnectionPool, Pool};
use crate::protocol::Protocol;
use crate::registry::Registry;
use crate::request::{ConnectionId, Message, Request, SeqId, SeqIdAllocator};

/// A generic asynchronous RPC client, parameterized over a [`Protocol`]
/// adapter that knows how to frame `P::Message` on the wire.
pub struct Client<P: Protocol> {
    protocol: P,
    config: ClientConfig,
    seq_ids: SeqIdAllocator,
    pool: Pool,
    endpoint_manager: Arc<EndpointManager>,
    pending: Arc<PendingQueue<P::Message>>,
    registry: Arc<Registry<P::Message>>,
    /// Requests handed to a connection's writer but not yet echoed back via
    /// `ConnectionEvent::StartSending`. Mirrors the teacher's transition from
    /// `send_queue` entry to `recv_queue` entry in `rpc/connection.rs`, here
    /// keyed by sequence id instead of living inside the connection itself
    /// (a connection here is just a handle, not an owner of request state).
    dispatching: DashMap<SeqId, Request<P::Message>>,
    live_connections: DashMap<ConnectionId, Connection>,
    node_of_connection: DashMap<ConnectionId, NodeId>,
    unknown_message_handler: parking_lot::Mutex<Option<Box<dyn Fn(Connection, P::Message) + Send + Sync>>>,
}

impl<P: Protocol> Client<P> {
    /// Builds a new client around `protocol` and spawns its background
    /// tasks: the connection/endpoint event loop, the pending-send ticker,
    /// and the receiving-registry timeout scanner.
    pub fn new(protocol: P, config: ClientConfig) -> Arc<Client<P>> {
        let is_async = protocol.is_async();
        let (connection_events_tx, connection_events_rx) = mpsc::unbounded_channel();
        let (endpoint_manager, endpoint_events_rx) = EndpointManager::with_backoff(
            config.connection_options.clone(),
            config.cold_connect_backoff,
            config.post_disconnect_backoff,
            connection_events_tx,
        );

        let max_in_flight = config.connection_options.max_in_flight_per_connection;
        let client = Arc::new(Client {
            protocol,
            pool: Pool::new(is_async, max_in_flight),
            endpoint_manager,
            pending: Arc::new(PendingQueue::new()),
            registry: Arc::new(Registry::new()),
            dispatching: DashMap::new(),
            live_connections: DashMap::new(),
            node_of_connection: DashMap::new(),
            unknown_message_handler: parking_lot::Mutex::new(None),
            config,
        });

        {
            // A `Weak` avoids a reference cycle through `registry`'s hook back
            // into the client that owns it (spec §9: "avoid naked
            // back-pointers"); once the client itself is dropped, the scan
            // loop's release calls become harmless no-ops instead of keeping
            // it alive forever.
            let weak_client = Arc::downgrade(&client);
            client.registry.set_on_timeout_release(move |connection_id| {
                if let Some(client) = weak_client.upgrade() {
                    client.release_connection(connection_id);
                }
            });
        }

        tokio::spawn(Client::run_event_loop(
            client.clone(),
            connection_events_rx,
            endpoint_events_rx,
        ));
        tokio::spawn(Client::run_pending_tick(client.clone()));
        tokio::spawn(client.registry.clone().run_scan_loop(client.config.registry_scan_interval));

        client
    }

    /// Installs the handler invoked when a parsed message's sequence id
    /// doesn't match any in-flight request (spec §6, `UnknownMessageReceived`).
    pub fn set_unknown_message_handler(
        &self,
        handler: impl Fn(Connection, P::Message) + Send + Sync + 'static,
    ) {
        *self.unknown_message_handler.lock() = Some(Box::new(handler));
    }

    /// Allocates a fresh sequence id without building a `Request` around it.
    ///
    /// Most real wire protocols embed the sequence id as a header field
    /// inside the serialized payload itself (the teacher's own
    /// `request_header.set_call_id(...)`, stamped into the header just
    /// before a call's bytes are serialized) — which means a caller needs
    /// the id *before* it can finish building the `payload` bytes that
    /// `new_request`/[`Client::new_request_with_seq_id`] will carry. Call
    /// this first, embed the id however the wire protocol requires, then
    /// pass both to `new_request_with_seq_id`.
    pub fn next_seq_id(&self) -> SeqId {
        self.seq_ids.next()
    }

    /// Allocates a fresh sequence id and builds a `Request` ready to be
    /// passed to [`Client::send`]. `allow_retry` defaults to `true`; flip the
    /// returned request's field directly before sending to disable retry for
    /// that call (spec §3's `allowRetry` is a per-request field, not a
    /// `NewRequest` parameter).
    ///
    /// Use this when the protocol's framing doesn't need the sequence id
    /// embedded in `payload` (e.g. it's carried in an out-of-band header the
    /// connection host attaches separately); otherwise see
    /// [`Client::new_request_with_seq_id`].
    pub fn new_request(
        &self,
        name: impl Into<String>,
        payload: Bytes,
        recv_timeout: Option<std::time::Duration>,
        on_exception: impl FnOnce(Error) + Send + 'static,
        on_result: impl FnOnce(P::Message) + Send + 'static,
    ) -> Request<P::Message> {
        self.new_request_with_seq_id(self.next_seq_id(), name, payload, recv_timeout, on_exception, on_result)
    }

    /// Like [`Client::new_request`], but for a sequence id obtained ahead of
    /// time from [`Client::next_seq_id`] so it could be embedded into
    /// `payload` before this call.
    #[allow(clippy::too_many_arguments)]
    pub fn new_request_with_seq_id(
        &self,
        seq_id: SeqId,
        name: impl Into<String>,
        payload: Bytes,
        recv_timeout: Option<std::time::Duration>,
        on_exception: impl FnOnce(Error) + Send + 'static,
        on_result: impl FnOnce(P::Message) + Send + 'static,
    ) -> Request<P::Message> {
        Request::new(
            seq_id,
            name,
            payload,
            recv_timeout.unwrap_or(self.config.default_receive_timeout),
            true,
            on_exception,
            on_result,
        )
    }

    /// Fire-and-forget dispatch. Attempts to acquire a connection from the
    /// pool; on success, hands the request to the connection's writer and
    /// stashes it in `dispatching` until the host echoes back
    /// `StartSending`. On failure (no connection available), enqueues on the
    /// pending-send queue to be retried on the next tick.
    pub fn send(self: &Arc<Self>, request: Request<P::Message>) {
        match self.pool.try_acquire() {
            Some(connection) => {
                let seq_id = request.seq_id;
                let payload = request.payload.clone();
                self.dispatching.insert(seq_id, request);
                connection.begin_send(seq_id, payload);
            }
            None => {
                self.pending.push(request);
            }
        }
    }

    pub fn try_register_endpoint(
        self: &Arc<Self>,
        name: impl Into<String>,
        remote_endpoint: SocketAddr,
        init_func: Option<InitFunc>,
    ) -> bool {
        self.endpoint_manager.try_register_endpoint(name, remote_endpoint, init_func)
    }

    pub fn unregister_endpoint(&self, name: &str) -> bool {
        self.endpoint_manager.unregister_endpoint(name)
    }

    pub fn get_all_registered_endpoints(&self) -> Vec<(String, SocketAddr)> {
        self.endpoint_manager.get_all_registered_endpoints()
    }

    /// Number of requests currently awaiting a response. Exposed for tests
    /// and diagnostics.
    pub fn in_flight_count(&self) -> usize {
        self.registry.len()
    }

    /// Number of connections currently registered with the pool. Exposed for
    /// tests and diagnostics.
    pub fn connection_count(&self) -> usize {
        self.pool.len()
    }

    async fn run_pending_tick(self: Arc<Self>) {
        loop {
            tokio::time::sleep(self.config.pending_tick_interval).await;
            for request in self.pending.drain_batch() {
                if request.age() > self.config.send_timeout {
                    let name = request.name.clone();
                    request.complete_err(Error::PendingSendTimeout { name });
                } else {
                    self.send(request);
                }
            }
        }
    }

    async fn run_event_loop(
        self: Arc<Self>,
        mut connection_events: mpsc::UnboundedReceiver<ConnectionEvent>,
        mut endpoint_events: mpsc::UnboundedReceiver<EndpointEvent>,
    ) {
        loop {
            tokio::select! {
                event = connection_events.recv() => {
                    match event {
                        Some(event) => self.handle_connection_event(event),
                        None => return,
                    }
                }
                event = endpoint_events.recv() => {
                    match event {
                        Some(event) => self.handle_endpoint_event(event),
                        None => return,
                    }
                }
            }
        }
    }

    fn handle_endpoint_event(self: &Arc<Self>, event: EndpointEvent) {
        match event {
            EndpointEvent::NodeConnected { node_id, connection } => {
                log::debug!("client: node {node_id} connected on connection {}", connection.id());
                self.live_connections.insert(connection.id(), connection.clone());
                self.node_of_connection.insert(connection.id(), node_id);
            }
            EndpointEvent::NodeAlreadyAvailable { node_id, connection } => {
                log::info!("client: node {node_id} available on connection {}", connection.id());
                self.pool.register(connection);
            }
            EndpointEvent::NodeInitFailed { node_id, error } => {
                log::warn!("client: node {node_id} initialization failed: {error}");
            }
        }
    }

    fn handle_connection_event(self: &Arc<Self>, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Connected { id } => {
                log::trace!("client: connection {id} connected");
            }
            ConnectionEvent::StartSending { id, seq_id } => {
                if let Some((_, mut request)) = self.dispatching.remove(&seq_id) {
                    request.send_connection = Some(id);
                    if !self.registry.try_add(request) {
                        log::error!(
                            "client: sequence id {seq_id} collided with an in-flight request; dropping duplicate"
                        );
                    }
                }
            }
            ConnectionEvent::SendComplete { id, seq_id, ok } => {
                if ok {
                    self.registry.mark_sent(seq_id, id);
                } else if let Some(request) = self.registry.try_remove(seq_id) {
                    // The connection itself may still be alive (only this
                    // write failed); give the sync pool a chance to reuse it
                    // before its owning reader task eventually notices the
                    // socket is dead and fires `Disconnected`.
                    self.release_connection(id);
                    self.on_send_failed(request);
                }
            }
            ConnectionEvent::MessageReceived { id, data } => {
                self.on_message_received(id, data);
            }
            ConnectionEvent::ConnectionError { id, error } => {
                log::warn!("client: connection {id} reported an error: {error}");
            }
            ConnectionEvent::Disconnected { id, error } => {
                log::info!("client: connection {id} disconnected ({error:?})");
                self.pool.destroy(id);
                self.live_connections.remove(&id);
                if let Some((_, node_id)) = self.node_of_connection.remove(&id) {
                    self.endpoint_manager.on_connection_lost(node_id, id);
                }
            }
        }
    }

    /// Reacts to a send failure per spec §4.1 step 3: bounded retry gated on
    /// `allow_retry` and on the request not yet having aged past the send
    /// timeout.
    fn on_send_failed(self: &Arc<Self>, request: Request<P::Message>) {
        if !request.allow_retry {
            let name = request.name.clone();
            request.complete_err(Error::SendFailed { name });
        } else if request.age() > self.config.send_timeout {
            let name = request.name.clone();
            request.complete_err(Error::PendingSendTimeout { name });
        } else {
            self.send(request);
        }
    }

    /// A single socket read can land more than one complete message in
    /// `data` at once (e.g. a multiplexed connection whose peer pipelined
    /// several responses into one TCP segment). Parse until the protocol
    /// reports it needs more bytes, rather than stopping after the first
    /// message and waiting for the next unrelated read to surface the rest.
    fn on_message_received(self: &Arc<Self>, connection_id: ConnectionId, data: Bytes) {
        let connection = match self.live_connections.get(&connection_id) {
            Some(entry) => entry.clone(),
            None => return,
        };

        let mut offset = 0;
        loop {
            match self.protocol.parse(&data[offset..]) {
                Ok(None) => break,
                Ok(Some((message, consumed))) => {
                    offset += consumed;
                    let seq_id = message.seq_id();
                    match self.registry.try_remove(seq_id) {
                        Some(request) => request.complete_ok(message),
                        None => self.handle_unknown_message(connection.clone(), message),
                    }
                    // The exchange this connection was holding is over: for
                    // the sync pool this returns it to the idle stack (spec
                    // §4.2); a no-op for the async pool, which never took it
                    // out of rotation in the first place. A sync connection
                    // only ever has one message to parse per read anyway
                    // (exactly one outstanding request), so this releases at
                    // most once per call in that mode.
                    self.pool.release(&connection);
                }
                Err(err) => {
                    log::warn!("client: protocol parse error on connection {connection_id}: {err}");
                    offset = data.len();
                    connection.begin_disconnect();
                    break;
                }
            }
        }
        connection.advance_read_buffer(offset);
    }

    /// Returns the connection identified by `connection_id` to the pool, if
    /// it's still live. Used both directly (a response just arrived) and via
    /// the registry's timeout-release hook (a request aged out without ever
    /// getting a response).
    fn release_connection(&self, connection_id: ConnectionId) {
        if let Some(connection) = self.live_connections.get(&connection_id) {
            self.pool.release(&connection);
        }
    }

    fn handle_unknown_message(&self, connection: Connection, message: P::Message) {
        let handler = self.unknown_message_handler.lock();
        match handler.as_ref() {
            Some(handler) => handler(connection, message),
            None => log::warn!(
                "client: received message for unknown sequence id {} with no unknown-message handler installed",
                message.seq_id()
            ),
        }
    }
}
