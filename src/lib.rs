//! A generic asynchronous RPC client that multiplexes many in-flight requests
//! across a managed pool of long-lived, reconnecting socket connections to
//! one or more named remote endpoints.
//!
//! The crate is protocol-agnostic: it treats messages as opaque values
//! bearing a sequence id, and delegates wire framing to a caller-supplied
//! [`Protocol`] implementation. It owns connect/reconnect with jittered
//! backoff, connection pooling (round-robin multiplexed or exclusive
//! stack-based, chosen from `Protocol::is_async`), per-request send/receive
//! timeouts, and bounded retry of transient send failures.
//!
//! See [`Client`] for the main entry point.

pub mod backoff;
pub mod client;
pub mod config;
pub mod connection;
pub mod dns;
pub mod endpoint;
pub mod error;
pub mod node;
pub mod pending;
pub mod pool;
pub mod protocol;
pub mod registry;
pub mod request;

pub use client::Client;
pub use config::ClientConfig;
pub use connection::{Connection, ConnectionEvent, ConnectionOptions};
pub use error::{Error, Result};
pub use node::{InitFunc, Node, NodeId};
pub use protocol::Protocol;
pub use request::{ConnectionId, Message, Request, SeqId};
