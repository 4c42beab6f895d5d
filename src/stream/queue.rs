use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::Notify;

use crate::model::Packet;

/// Result of pushing a poll's packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PushOutcome {
    /// Oldest packets evicted to stay within capacity.
    pub dropped: usize,
    /// Queue length after the push.
    pub depth: usize,
}

/// Bounded FIFO hand-off between the reader and the writer.
///
/// Overflow evicts the oldest packets so the reader never blocks.
pub struct PacketQueue {
    inner: parking_lot::Mutex<VecDeque<Packet>>,
    notify: Notify,
    capacity: usize,
    high_water: AtomicUsize,
}

impl PacketQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: parking_lot::Mutex::new(VecDeque::with_capacity(capacity.min(4096))),
            notify: Notify::new(),
            capacity,
            high_water: AtomicUsize::new(0),
        }
    }

    /// Append packets in order, evicting from the front past capacity.
    pub fn push_all(&self, packets: Vec<Packet>) -> PushOutcome {
        let (dropped, depth) = {
            let mut q = self.inner.lock();
            q.extend(packets);
            let dropped = q.len().saturating_sub(self.capacity);
            if dropped > 0 {
                q.drain(..dropped);
            }
            (dropped, q.len())
        };

        self.high_water.fetch_max(depth, Ordering::Relaxed);
        self.notify.notify_one();

        PushOutcome { dropped, depth }
    }

    /// Take everything currently queued, in push order.
    pub fn drain_all(&self) -> Vec<Packet> {
        let mut q = self.inner.lock();
        q.drain(..).collect()
    }

    /// Wait until the queue is non-empty or `timeout` elapses.
    ///
    /// Returns whether data is available.
    pub async fn wait_for_data(&self, timeout: Duration) -> bool {
        if !self.is_empty() {
            return true;
        }

        let notified = self.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        // Re-check after registering so a push in between is not missed.
        if !self.is_empty() {
            return true;
        }

        let _ = tokio::time::timeout(timeout, notified).await;
        !self.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Largest depth observed since creation.
    pub fn high_water_mark(&self) -> usize {
        self.high_water.load(Ordering::Relaxed)
    }
}
