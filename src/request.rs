//! The inert request record and the sequence id allocator that stamps it.

use std::fmt;
use std::sync::atomic::{AtomicI32, AtomicI64, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::error::Error;

/// A sequence id correlating a sent request to its response.
///
/// Always positive and representable in 31 bits, per the wire invariant: the top
/// bit is reserved (always zero) so that protocols that repurpose it (e.g. as a
/// sign bit for out-of-band call ids) remain free to do so.
pub type SeqId = i32;

/// Allocates sequence ids for a single client's lifetime.
///
/// Ids are assigned by atomic increment starting at 1, and wrap back to 1 once
/// `i32::MAX` is reached rather than overflowing into negative values.
#[derive(Debug, Default)]
pub struct SeqIdAllocator(AtomicI32);

impl SeqIdAllocator {
    pub fn new() -> Self {
        SeqIdAllocator(AtomicI32::new(0))
    }

    /// Allocates and returns the next sequence id.
    pub fn next(&self) -> SeqId {
        loop {
            let current = self.0.load(Ordering::Relaxed);
            let next = if current >= i32::MAX { 1 } else { current + 1 };
            if self
                .0
                .compare_exchange_weak(current, next, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                return next;
            }
        }
    }
}


/// Opaque identifier for a connection, unique for the lifetime of the process.
///
/// Connections never recycle an id, which keeps stale references (e.g. a dead
/// entry left behind on the sync pool's idle stack) unambiguous: a `ConnectionId`
/// observed once always refers to the same socket.
pub type ConnectionId = i64;

static NEXT_CONNECTION_ID: AtomicI64 = AtomicI64::new(1);

/// Allocates the next process-wide unique connection id.
pub fn next_connection_id() -> ConnectionId {
    NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed)
}

/// Opaque message contract: the core only ever needs a response's sequence id to
/// correlate it back to the request that produced it.
pub trait Message: Send + 'static {
    /// The sequence id this message is responding to.
    fn seq_id(&self) -> SeqId;
}

/// One in-flight call: everything the client needs to dispatch a request, track
/// its lifecycle, and complete it exactly once.
///
/// A `Request` is always uniquely owned by whichever component currently has
/// custody of it (the caller, the pending-send queue, or the receiving
/// registry); completion consumes `self`, which is what makes the "complete
/// exactly once" invariant a property of Rust's ownership model rather than
/// something that has to be checked at runtime.
pub struct Request<M: Message> {
    pub seq_id: SeqId,
    pub name: String,
    pub payload: Bytes,
    pub recv_timeout: Duration,
    pub created_at: Instant,
    /// Set once the send-complete callback fires successfully.
    pub sent_at: Option<Instant>,
    /// The connection currently carrying this request, if any.
    pub send_connection: Option<ConnectionId>,
    pub allow_retry: bool,
    on_result: Option<Box<dyn FnOnce(M) + Send>>,
    on_exception: Option<Box<dyn FnOnce(Error) + Send>>,
}

impl<M: Message> fmt::Debug for Request<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("seq_id", &self.seq_id)
            .field("name", &self.name)
            .field("payload_len", &self.payload.len())
            .field("recv_timeout", &self.recv_timeout)
            .field("created_at", &self.created_at)
            .field("sent_at", &self.sent_at)
            .field("send_connection", &self.send_connection)
            .field("allow_retry", &self.allow_retry)
            .finish()
    }
}

impl<M: Message> Request<M> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        seq_id: SeqId,
        name: impl Into<String>,
        payload: Bytes,
        recv_timeout: Duration,
        allow_retry: bool,
        on_exception: impl FnOnce(Error) + Send + 'static,
        on_result: impl FnOnce(M) + Send + 'static,
    ) -> Self {
        Request {
            seq_id,
            name: name.into(),
            payload,
            recv_timeout,
            created_at: Instant::now(),
            sent_at: None,
            send_connection: None,
            allow_retry,
            on_result: Some(Box::new(on_result)),
            on_exception: Some(Box::new(on_exception)),
        }
    }

    /// Age of the request since creation.
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Completes the request with a successful result, dispatching the
    /// callback onto the async runtime's worker pool so the calling task (the
    /// registry timer, the I/O read loop, ...) is never blocked by user code.
    pub fn complete_ok(mut self, message: M) {
        let name = self.name.clone();
        if let Some(on_result) = self.on_result.take() {
            tokio::spawn(async move {
                on_result(message);
            });
        } else {
            log::error!("request {name:?} completed twice; dropping successful result");
        }
    }

    /// Completes the request with a terminal error, dispatching the callback
    /// onto the async runtime's worker pool.
    pub fn complete_err(mut self, error: Error) {
        let name = self.name.clone();
        if let Some(on_exception) = self.on_exception.take() {
            tokio::spawn(async move {
                on_exception(error);
            });
        } else {
            log::error!("request {name:?} completed twice; dropping error {error}");
        }
    }
}
