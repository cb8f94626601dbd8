//! The protocol adapter contract: the one piece of the system that actually
//! knows the wire format. The core never looks inside a message or a payload;
//! it only needs to know how to carve the next message out of a byte buffer,
//! and whether the protocol allows multiple requests in flight at once on a
//! single connection.

use crate::error::Error;
use crate::request::Message;

/// Parses framed messages out of a connection's accumulated byte buffer, and
/// declares whether the protocol supports multiplexing (many requests
/// in-flight per connection) or requires exclusive per-connection use.
pub trait Protocol: Send + Sync + 'static {
    /// The message type this protocol parses.
    type Message: Message;

    /// Whether this protocol allows multiple requests to be in flight on a
    /// single connection at once.
    ///
    /// `true` selects the round-robin [`crate::pool::AsyncPool`] at client
    /// construction; `false` selects the exclusive-acquire
    /// [`crate::pool::SyncPool`].
    fn is_async(&self) -> bool;

    /// Attempts to parse the next message out of `buf`.
    ///
    /// Returns `Ok(None)` if `buf` doesn't yet contain a complete message
    /// (the caller should wait for more bytes and try again once they
    /// arrive). Returns
    /// `Ok(Some((message, consumed)))` when a message was parsed, where
    /// `consumed` is the number of bytes at the front of `buf` that made up
    /// that message (`0 < consumed <= buf.len()`). Returns `Err` for a fatal
    /// framing error; the caller must tear down the connection and should
    /// treat the entire buffer as consumed.
    fn parse(&self, buf: &[u8]) -> Result<Option<(Self::Message, usize)>, Error>;
}
