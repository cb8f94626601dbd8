//! Randomized reconnect backoff.
//!
//! Each call is an independent uniform draw over a fixed range rather than an
//! exponentially growing one. The goal isn't "wait longer each time a single
//! connection fails" but "desynchronize many clients restarting against the
//! same server", which a fresh uniform draw per scheduling point accomplishes
//! without any state to carry between attempts.

use std::time::Duration;

use rand::Rng;

/// A uniform millisecond range backoff is drawn from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffRange {
    pub min_ms: u64,
    pub max_ms: u64,
}

impl BackoffRange {
    pub const fn new(min_ms: u64, max_ms: u64) -> Self {
        BackoffRange { min_ms, max_ms }
    }

    /// Draws an independent random duration from `[min_ms, max_ms]`.
    pub fn sample(&self) -> Duration {
        let ms = if self.min_ms >= self.max_ms {
            self.min_ms
        } else {
            rand::thread_rng().gen_range(self.min_ms..=self.max_ms)
        };
        Duration::from_millis(ms)
    }
}

/// Backoff window used after a cold-connect failure (the remote never accepted
/// the TCP connection at all).
pub const COLD_CONNECT_BACKOFF: BackoffRange = BackoffRange::new(1000, 3000);

/// Backoff window used after a previously-connected socket disconnects. Shorter
/// than the cold-connect window, on the theory that a peer-initiated drop (e.g. a
/// graceful server restart) is likely to clear quickly.
pub const POST_DISCONNECT_BACKOFF: BackoffRange = BackoffRange::new(100, 1500);
