//! Error types returned by the client and its internal components.

use std::io;

use thiserror::Error;

/// An error delivered to a request's `on_exception` callback, or returned from a
/// fallible client operation.
///
/// Every terminal request error carries the originating request's logical `name`
/// so that callers can distinguish which in-flight call failed without needing to
/// capture it themselves.
#[derive(Debug, Error)]
pub enum Error {
    /// The request aged out of the pending-send queue, or out of a retry attempt,
    /// before it could be handed to a connection for sending.
    #[error("request {name:?} timed out waiting for a connection to send on")]
    PendingSendTimeout {
        /// The logical name of the request that timed out.
        name: String,
    },

    /// The transport reported a send failure and the request was constructed with
    /// `allow_retry = false`.
    #[error("request {name:?} failed to send and retry is disabled")]
    SendFailed {
        /// The logical name of the request that failed to send.
        name: String,
    },

    /// No response arrived within the request's receive deadline.
    #[error("request {name:?} timed out waiting for a response")]
    ReceiveTimeout {
        /// The logical name of the request that timed out.
        name: String,
    },

    /// An I/O error occurred on a connection.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// The protocol adapter failed to parse an inbound buffer into a message.
    #[error("protocol parse error: {0}")]
    Protocol(String),

    /// A per-node initialization callback failed.
    #[error("endpoint initialization failed for node {name:?}: {source}")]
    InitFailed {
        /// The name of the node whose `init_func` failed.
        name: String,
        /// The underlying error.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

/// Convenience alias used throughout the crate's internals.
pub type Result<T> = std::result::Result<T, Error>;
