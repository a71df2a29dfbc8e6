//! Bounded fan-in queue between the per-interface receivers and the
//! single dispatcher.
//!
//! Backpressure is lossy and explicit: when the queue is full the
//! oldest entry is dropped and counted, so a burst can never wedge a
//! receiver. One consumer only.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use tokio::sync::Notify;

pub struct FanInQueue<T> {
    inner: Mutex<VecDeque<T>>,
    capacity: usize,
    notify: Notify,
    dropped: AtomicU64,
    closed: AtomicBool,
}

impl<T> FanInQueue<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "fan-in queue needs a positive capacity");
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Enqueues an item, evicting the oldest entry when full.
    pub fn push(&self, item: T) {
        {
            let mut queue = self.inner.lock().unwrap();
            if queue.len() == self.capacity {
                queue.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            queue.push_back(item);
        }
        self.notify.notify_one();
    }

    /// Waits for the next item; `None` once the queue is closed and
    /// drained.
    pub async fn pop(&self) -> Option<T> {
        loop {
            let notified = self.notify.notified();
            if let Some(item) = self.inner.lock().unwrap().pop_front() {
                return Some(item);
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            notified.await;
        }
    }

    /// Stops the consumer once the backlog drains.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn fifo_order() {
        let queue = FanInQueue::new(8);
        queue.push(1);
        queue.push(2);
        queue.push(3);
        assert_eq!(queue.pop().await, Some(1));
        assert_eq!(queue.pop().await, Some(2));
        assert_eq!(queue.pop().await, Some(3));
    }

    #[tokio::test]
    async fn overflow_drops_the_oldest() {
        let queue = FanInQueue::new(2);
        queue.push(1);
        queue.push(2);
        queue.push(3);
        assert_eq!(queue.dropped(), 1);
        assert_eq!(queue.pop().await, Some(2));
        assert_eq!(queue.pop().await, Some(3));
    }

    #[tokio::test]
    async fn close_drains_then_ends() {
        let queue = FanInQueue::new(4);
        queue.push(7);
        queue.close();
        assert_eq!(queue.pop().await, Some(7));
        assert_eq!(queue.pop().await, None);
    }

    #[tokio::test]
    async fn consumer_wakes_on_push() {
        let queue = Arc::new(FanInQueue::new(4));
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        queue.push(42u32);
        assert_eq!(consumer.await.unwrap(), Some(42));
    }
}
