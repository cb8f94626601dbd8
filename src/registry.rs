//! The receiving registry: the sequence-id-indexed map of in-flight requests,
//! and the timer that ages entries out via `ReceiveTimeout`.
//!
//! Generalized from "one map per connection" to "one map for the whole
//! client": a multiplexed async connection can have responses arrive on
//! whichever connection is cheapest for the server to answer on, so
//! correlation has to be global, not per-socket. Backed by a lock-free
//! `dashmap` concurrent map.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::error::Error;
use crate::request::{ConnectionId, Message, Request, SeqId};

/// Default interval between receive-timeout scans.
pub const DEFAULT_SCAN_INTERVAL: Duration = Duration::from_millis(500);

/// Maps sequence ids to the request awaiting a response.
///
/// `try_add`/`try_remove` are the two linearization points the rest of the
/// client relies on: removal from the registry is the single commit point for
/// "this request is no longer anyone else's to complete", the completion-once
/// guarantee every caller depends on.
pub struct Registry<M: Message> {
    entries: DashMap<SeqId, Request<M>>,
    len: AtomicUsize,
    /// Invoked with a request's `send_connection` whenever the timeout scan
    /// ages it out. Lets the client return the connection to the sync pool's
    /// idle stack even though the scan loop runs independently of the
    /// client's own event loop; a no-op by default (the async pool has
    /// nothing to release).
    on_timeout_release: Mutex<Option<Box<dyn Fn(ConnectionId) + Send + Sync>>>,
}

impl<M: Message> Default for Registry<M> {
    fn default() -> Self {
        Registry {
            entries: DashMap::new(),
            len: AtomicUsize::new(0),
            on_timeout_release: Mutex::new(None),
        }
    }
}

impl<M: Message> Registry<M> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs the hook invoked with a request's bound connection id whenever
    /// the timeout scan ages that request out. The client wires this to
    /// `Pool::release` so a sync-pool connection whose request timed out
    /// (rather than completing via `try_remove` in the client's own event
    /// loop) is still returned to circulation instead of leaking out of
    /// rotation forever.
    pub fn set_on_timeout_release(&self, hook: impl Fn(ConnectionId) + Send + Sync + 'static) {
        *self.on_timeout_release.lock() = Some(Box::new(hook));
    }

    /// Registers `request` as in-flight. Returns `false` (and drops nothing)
    /// if a request with the same sequence id is already registered, which
    /// would indicate a sequence id collision bug upstream rather than a
    /// condition this registry should paper over.
    pub fn try_add(&self, request: Request<M>) -> bool {
        match self.entries.entry(request.seq_id) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(request);
                self.len.fetch_add(1, Ordering::Relaxed);
                true
            }
        }
    }

    /// Removes and returns the request registered under `seq_id`, if any. This
    /// is the only way a request leaves the registry other than the timeout
    /// scan, and the two are mutually exclusive by construction (`DashMap`
    /// removal is atomic per key).
    pub fn try_remove(&self, seq_id: SeqId) -> Option<Request<M>> {
        let removed = self.entries.remove(&seq_id).map(|(_, req)| req);
        if removed.is_some() {
            self.len.fetch_sub(1, Ordering::Relaxed);
        }
        removed
    }

    /// Records that the send for `seq_id` completed successfully on
    /// `connection_id`, stamping `sent_at`. A request with `sent_at` still
    /// unset is treated by the timeout scan as not-yet-timing-out, tolerating
    /// the window between `OnStartSending` (registration) and `OnSendCallback`
    /// (this call).
    pub fn mark_sent(&self, seq_id: SeqId, connection_id: ConnectionId) {
        if let Some(mut entry) = self.entries.get_mut(&seq_id) {
            entry.sent_at = Some(Instant::now());
            entry.send_connection = Some(connection_id);
        }
    }

    /// Number of requests currently in flight.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Scans once for entries whose receive deadline has passed, removing and
    /// completing each with [`Error::ReceiveTimeout`].
    fn scan_once(&self) {
        let now = Instant::now();
        let expired: Vec<SeqId> = self
            .entries
            .iter()
            .filter_map(|entry| {
                let sent_at = entry.sent_at?;
                if now.saturating_duration_since(sent_at) > entry.recv_timeout {
                    Some(entry.seq_id)
                } else {
                    None
                }
            })
            .collect();

        for seq_id in expired {
            if let Some(request) = self.try_remove(seq_id) {
                if let Some(connection_id) = request.send_connection {
                    if let Some(hook) = self.on_timeout_release.lock().as_ref() {
                        hook(connection_id);
                    }
                }
                let name = request.name.clone();
                request.complete_err(Error::ReceiveTimeout { name });
            }
        }
    }

    /// Runs the 500-ms receive-timeout scan forever. Intended to be spawned
    /// once per client (`tokio::spawn(registry.clone().run_scan_loop(...))`);
    /// re-arms itself after each tick completes rather than using a repeating
    /// interval, so a slow scan never overlaps with the next one.
    pub async fn run_scan_loop(self: Arc<Self>, interval: Duration) -> ! {
        loop {
            tokio::time::sleep(interval).await;
            self.scan_once();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    struct Echo(SeqId);
    impl Message for Echo {
        fn seq_id(&self) -> SeqId {
            self.0
        }
    }

    fn noop_request(seq_id: SeqId, recv_timeout: Duration) -> Request<Echo> {
        Request::new(
            seq_id,
            "test.method",
            Bytes::new(),
            recv_timeout,
            true,
            |_err| {},
            |_msg| {},
        )
    }

    #[test]
    fn add_remove_round_trips() {
        let registry: Registry<Echo> = Registry::new();
        assert!(registry.try_add(noop_request(1, Duration::from_secs(1))));
        assert_eq!(registry.len(), 1);
        assert!(registry.try_remove(1).is_some());
        assert_eq!(registry.len(), 0);
        assert!(registry.try_remove(1).is_none());
    }

    #[test]
    fn duplicate_add_is_rejected() {
        let registry: Registry<Echo> = Registry::new();
        assert!(registry.try_add(noop_request(1, Duration::from_secs(1))));
        assert!(!registry.try_add(noop_request(1, Duration::from_secs(1))));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn unsent_entries_do_not_expire() {
        let registry: Registry<Echo> = Registry::new();
        // recv_timeout of zero would expire instantly if sent_at were set;
        // since mark_sent is never called, the scan must skip it.
        registry.try_add(noop_request(1, Duration::from_millis(0)));
        registry.scan_once();
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn sent_entry_expires_after_scan() {
        let registry: Registry<Echo> = Registry::new();
        registry.try_add(noop_request(1, Duration::from_millis(0)));
        registry.mark_sent(1, 99);
        std::thread::sleep(Duration::from_millis(5));
        registry.scan_once();
        assert_eq!(registry.len(), 0);
    }
}
