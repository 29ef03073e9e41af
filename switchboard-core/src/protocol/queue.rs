//! Bounded lossy queues between the connection reader and the pipeline.
//!
//! Live audio has no value after two seconds of backlog, so the audio
//! queue drops the oldest chunk on overflow (stays near the present).
//! DTMF is the opposite: the oldest digits complete a number the caller
//! already dialed, so the DTMF queue drops the newest on overflow.
//!
//! Single consumer per queue: the connection handler task (or the task it
//! delegates to — listener loop or barge-in monitor) is the only getter.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, warn};

/// What to evict when a full queue receives another item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Evict the oldest item (audio: favor the present).
    DropOldest,
    /// Reject the incoming item (DTMF: favor the past).
    DropNewest,
}

/// A bounded FIFO with an explicit overflow policy.
pub struct BoundedQueue<T> {
    items: Mutex<VecDeque<T>>,
    notify: Notify,
    capacity: usize,
    policy: OverflowPolicy,
    label: &'static str,
    closed: AtomicBool,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize, policy: OverflowPolicy, label: &'static str) -> Self {
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            capacity: capacity.max(1),
            policy,
            label,
            closed: AtomicBool::new(false),
        }
    }

    /// Insert without blocking, applying the overflow policy when full.
    /// Returns `false` when the incoming item was rejected (DropNewest).
    pub fn try_put(&self, item: T) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        let accepted = {
            let mut items = self.items.lock();
            if items.len() >= self.capacity {
                match self.policy {
                    OverflowPolicy::DropOldest => {
                        items.pop_front();
                        debug!(queue = self.label, "queue full, dropping oldest item");
                        items.push_back(item);
                        true
                    }
                    OverflowPolicy::DropNewest => {
                        warn!(queue = self.label, "queue full, dropping incoming item");
                        false
                    }
                }
            } else {
                items.push_back(item);
                true
            }
        };
        if accepted {
            self.notify.notify_one();
        }
        accepted
    }

    /// Wait until an item is available. Returns `None` once the queue is
    /// closed and drained.
    pub async fn get(&self) -> Option<T> {
        loop {
            if let Some(item) = self.items.lock().pop_front() {
                return Some(item);
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            self.notify.notified().await;
        }
    }

    /// Like `get`, but gives up after `timeout`.
    pub async fn get_timeout(&self, timeout: Duration) -> Option<T> {
        tokio::time::timeout(timeout, self.get()).await.ok().flatten()
    }

    pub fn has_items(&self) -> bool {
        !self.items.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wake all waiters; subsequent `get` calls drain then return `None`.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
        self.notify.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fifo_order_preserved() {
        let queue = BoundedQueue::new(8, OverflowPolicy::DropOldest, "test");
        for i in 0..5 {
            assert!(queue.try_put(i));
        }
        for i in 0..5 {
            assert_eq!(queue.get().await, Some(i));
        }
    }

    #[tokio::test]
    async fn drop_oldest_keeps_most_recent() {
        let queue = BoundedQueue::new(3, OverflowPolicy::DropOldest, "audio");
        for i in 0..5 {
            assert!(queue.try_put(i));
        }
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.get().await, Some(2));
        assert_eq!(queue.get().await, Some(3));
        assert_eq!(queue.get().await, Some(4));
    }

    #[tokio::test]
    async fn drop_newest_rejects_incoming() {
        let queue = BoundedQueue::new(3, OverflowPolicy::DropNewest, "dtmf");
        for i in 0..3 {
            assert!(queue.try_put(i));
        }
        assert!(!queue.try_put(99));
        assert_eq!(queue.get().await, Some(0));
        assert_eq!(queue.get().await, Some(1));
        assert_eq!(queue.get().await, Some(2));
    }

    #[tokio::test]
    async fn get_timeout_returns_none_when_empty() {
        let queue: BoundedQueue<u8> = BoundedQueue::new(4, OverflowPolicy::DropOldest, "test");
        let got = queue.get_timeout(Duration::from_millis(20)).await;
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn get_wakes_on_put_from_another_task() {
        let queue = std::sync::Arc::new(BoundedQueue::new(4, OverflowPolicy::DropOldest, "test"));
        let producer = std::sync::Arc::clone(&queue);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            producer.try_put(42u8);
        });
        let got = queue.get_timeout(Duration::from_secs(1)).await;
        assert_eq!(got, Some(42));
    }

    #[tokio::test]
    async fn close_wakes_waiters_and_drains() {
        let queue = std::sync::Arc::new(BoundedQueue::new(4, OverflowPolicy::DropOldest, "test"));
        queue.try_put(7u8);
        queue.close();
        assert_eq!(queue.get().await, Some(7));
        assert_eq!(queue.get().await, None);
        assert!(!queue.try_put(8u8));
    }

    #[tokio::test]
    async fn has_items_reflects_contents() {
        let queue = BoundedQueue::new(4, OverflowPolicy::DropOldest, "test");
        assert!(!queue.has_items());
        queue.try_put(1u8);
        assert!(queue.has_items());
    }
}
