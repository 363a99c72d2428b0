//! Lock-protected pedal event FIFO bridging the control and audio threads

use std::collections::VecDeque;
use std::sync::RwLock;

use stomp_core::PedalEvent;
use tracing::warn;

/// Bounded FIFO of pedal events. Enqueue takes the write lock and may
/// block briefly; the audio loop dequeues with a non-blocking lock
/// attempt and simply skips the cycle under contention, so it never waits
/// on the control thread.
pub struct PedalQueue {
    inner: RwLock<VecDeque<PedalEvent>>,
    capacity: usize,
}

impl PedalQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: RwLock::new(VecDeque::new()),
            capacity,
        }
    }

    /// Append an event. Returns false (dropping the event) when full.
    pub fn enqueue(&self, event: PedalEvent) -> bool {
        let Ok(mut queue) = self.inner.write() else {
            return false;
        };
        if queue.len() >= self.capacity {
            warn!(?event, "pedal queue full, dropping event");
            return false;
        }
        queue.push_back(event);
        true
    }

    /// Pop the oldest event without blocking. Returns None when the queue
    /// is empty or a writer currently holds the lock.
    pub fn try_dequeue(&self) -> Option<PedalEvent> {
        self.inner.try_write().ok()?.pop_front()
    }

    pub fn clear(&self) {
        if let Ok(mut queue) = self.inner.write() {
            queue.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().map(|q| q.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
