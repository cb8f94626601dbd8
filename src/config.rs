//! Client-wide configuration: socket/message buffer sizes, send/receive
//! timeouts, the two reconnect backoff windows, and the two periodic-tick
//! intervals. Built with a `with_*` builder style rather than public mutable
//! fields so future additions don't break callers who construct it
//! positionally.

use std::time::Duration;

use crate::backoff::{BackoffRange, COLD_CONNECT_BACKOFF, POST_DISCONNECT_BACKOFF};
use crate::connection::ConnectionOptions;

/// Default send timeout: send and receive default to the same duration.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_millis(3000);
/// Default per-request receive timeout, used by [`crate::client::Client::new_request`]
/// when no override is given.
pub const DEFAULT_RECEIVE_TIMEOUT: Duration = Duration::from_millis(3000);
/// Default pending-send queue tick interval.
pub const DEFAULT_PENDING_TICK: Duration = Duration::from_millis(50);
/// Default receiving-registry scan interval.
pub const DEFAULT_REGISTRY_SCAN_TICK: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub connection_options: ConnectionOptions,
    pub send_timeout: Duration,
    pub default_receive_timeout: Duration,
    pub cold_connect_backoff: BackoffRange,
    pub post_disconnect_backoff: BackoffRange,
    pub pending_tick_interval: Duration,
    pub registry_scan_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            connection_options: ConnectionOptions::default(),
            send_timeout: DEFAULT_SEND_TIMEOUT,
            default_receive_timeout: DEFAULT_RECEIVE_TIMEOUT,
            cold_connect_backoff: COLD_CONNECT_BACKOFF,
            post_disconnect_backoff: POST_DISCONNECT_BACKOFF,
            pending_tick_interval: DEFAULT_PENDING_TICK,
            registry_scan_interval: DEFAULT_REGISTRY_SCAN_TICK,
        }
    }
}

impl ClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_connection_options(mut self, options: ConnectionOptions) -> Self {
        self.connection_options = options;
        self
    }

    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    pub fn with_default_receive_timeout(mut self, timeout: Duration) -> Self {
        self.default_receive_timeout = timeout;
        self
    }

    pub fn with_reconnect_backoff(mut self, cold_connect: BackoffRange, post_disconnect: BackoffRange) -> Self {
        self.cold_connect_backoff = cold_connect;
        self.post_disconnect_backoff = post_disconnect;
        self
    }

    pub fn with_pending_tick_interval(mut self, interval: Duration) -> Self {
        self.pending_tick_interval = interval;
        self
    }

    pub fn with_registry_scan_interval(mut self, interval: Duration) -> Self {
        self.registry_scan_interval = interval;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let config = ClientConfig::default();
        assert_eq!(config.send_timeout, Duration::from_millis(3000));
        assert_eq!(config.default_receive_timeout, Duration::from_millis(3000));
        assert_eq!(config.connection_options.socket_buffer_size, 8192);
        assert_eq!(config.connection_options.message_buffer_size, 8192);
        assert_eq!(config.connection_options.max_message_length, 16 * 1024 * 1024);
        assert_eq!(config.connection_options.max_in_flight_per_connection, None);
    }

    #[test]
    fn builder_overrides_apply() {
        let config = ClientConfig::new().with_send_timeout(Duration::from_millis(500));
        assert_eq!(config.send_timeout, Duration::from_millis(500));
    }
}
