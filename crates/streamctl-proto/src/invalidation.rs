// invalidation.rs -- bounded queue of reference-frame invalidation tuples
//
// Shared between the Connection Quality Monitor (producer) and the Control
// Session's invalidation worker (consumer). Converted in spirit from
// myq2-common's net_queue.rs: a small bounded FIFO plus a wakeup signal,
// except here the queue itself needs random-access coalescing on the
// consumer side, so it's a plain mutex-guarded deque rather than a channel.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crossbeam::channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;

/// Capacity of the invalidation-tuple FIFO.
pub const INVALIDATION_QUEUE_CAPACITY: usize = 20;

/// A `(startFrame, endFrame)` pair with `startFrame <= endFrame`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameRange {
    pub start: u64,
    pub end: u64,
}

impl FrameRange {
    pub fn new(start: u64, end: u64) -> Self {
        debug_assert!(start <= end, "invalidation range must be non-decreasing");
        Self { start, end }
    }
}

/// Bounded queue of pending invalidation tuples, with an `idr_required`
/// escalation flag and a wakeup signal for the invalidation worker.
pub struct InvalidationQueue {
    queue: Mutex<VecDeque<FrameRange>>,
    idr_required: AtomicBool,
    notify_tx: Sender<()>,
    notify_rx: Receiver<()>,
}

impl InvalidationQueue {
    pub fn new() -> Self {
        let (notify_tx, notify_rx) = bounded(1);
        Self {
            queue: Mutex::new(VecDeque::with_capacity(INVALIDATION_QUEUE_CAPACITY)),
            idr_required: AtomicBool::new(false),
            notify_tx,
            notify_rx,
        }
    }

    fn notify(&self) {
        // Best-effort: the channel is a binary wakeup, not a counter. If
        // it's already full the worker hasn't drained its last wakeup yet.
        let _ = self.notify_tx.try_send(());
    }

    /// Block until the invalidation worker has work to do.
    pub fn wait(&self) {
        let _ = self.notify_rx.recv();
    }

    /// Block with a timeout; used during shutdown so the worker can observe
    /// a stop signal without blocking forever.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.notify_rx.recv_timeout(timeout).is_ok()
    }

    /// Block until either work arrives or `stop` closes. Returns `true` for
    /// "work arrived", `false` for "stop signaled" -- the invalidation
    /// worker's cancellation point.
    pub fn wait_or_stop(&self, stop: &Receiver<()>) -> bool {
        crossbeam::channel::select! {
            recv(self.notify_rx) -> _ => true,
            recv(stop) -> _ => false,
        }
    }

    /// Record a detected loss range. If the queue has no room, escalate to
    /// a full IDR request instead.
    pub fn detected_frame_loss(&self, start: u64, end: u64) {
        let mut full = false;
        {
            let mut q = self.queue.lock();
            if q.len() >= INVALIDATION_QUEUE_CAPACITY {
                full = true;
            } else {
                q.push_back(FrameRange::new(start, end));
            }
        }
        if full {
            tracing::debug!("invalidation queue full, escalating to IDR request");
            self.idr_required.store(true, Ordering::SeqCst);
        }
        self.notify();
    }

    /// Force an IDR request regardless of queue state.
    pub fn request_idr_on_demand(&self) {
        self.idr_required.store(true, Ordering::SeqCst);
        self.notify();
    }

    /// Consume the `idr_required` flag, if set.
    pub fn take_idr_required(&self) -> bool {
        self.idr_required.swap(false, Ordering::SeqCst)
    }

    /// Drop every queued tuple (called when an IDR request supersedes them).
    pub fn drain_all(&self) {
        self.queue.lock().clear();
    }

    /// Pop the head tuple and coalesce it with every subsequent queued tuple
    /// whose range monotonically extends it: `(a1, bn)` for tuples arriving
    /// in non-decreasing `end` order.
    pub fn pop_coalesced(&self) -> Option<FrameRange> {
        let mut q = self.queue.lock();
        let mut head = q.pop_front()?;
        while let Some(next) = q.pop_front() {
            debug_assert!(next.end >= head.end, "invalidation tuples must arrive in non-decreasing end order");
            head.end = next.end;
        }
        Some(head)
    }
}

impl Default for InvalidationQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coalesces_in_order_tuples() {
        let q = InvalidationQueue::new();
        q.detected_frame_loss(100, 200);
        q.detected_frame_loss(201, 250);
        let merged = q.pop_coalesced().unwrap();
        assert_eq!(merged, FrameRange::new(100, 250));
        assert!(q.pop_coalesced().is_none());
    }

    #[test]
    fn escalates_to_idr_when_full() {
        let q = InvalidationQueue::new();
        for i in 0..INVALIDATION_QUEUE_CAPACITY as u64 {
            q.detected_frame_loss(i, i);
        }
        assert!(!q.take_idr_required());
        q.detected_frame_loss(1000, 1001);
        assert!(q.take_idr_required());
    }

    #[test]
    fn request_idr_on_demand_sets_flag() {
        let q = InvalidationQueue::new();
        assert!(!q.take_idr_required());
        q.request_idr_on_demand();
        assert!(q.take_idr_required());
        assert!(!q.take_idr_required());
    }
}
