//! Bounded drop-oldest queues and lockable in-flight packets
//!
//! A packet travels through two queues at once: a device-wide work queue
//! (decryption or encryption) as a [`Job`] holding the element's lock, and
//! the peer's ordered queue as a bare [`Element`]. The sequential stage
//! blocks on the element lock until the worker releases it, which keeps
//! per-peer order while the crypto runs in parallel.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{MutexGuard, Notify, OwnedMutexGuard};

/// Fixed-capacity FIFO that never blocks producers
pub struct DropQueue<T> {
    items: Mutex<VecDeque<T>>,
    capacity: usize,
    notify: Notify,
    closed: AtomicBool,
}

impl<T> DropQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Append `item`; when full the oldest entry is evicted and returned
    pub fn push(&self, item: T) -> Option<T> {
        let evicted = {
            let mut items = self.items.lock();
            let evicted = if items.len() >= self.capacity {
                items.pop_front()
            } else {
                None
            };
            items.push_back(item);
            evicted
        };
        self.notify.notify_one();
        evicted
    }

    /// Next item in FIFO order; `None` once the queue is closed
    pub async fn pop(&self) -> Option<T> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            if let Some(item) = self.items.lock().pop_front() {
                return Some(item);
            }
            notified.await;
        }
    }

    pub fn try_pop(&self) -> Option<T> {
        self.items.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Discard everything queued
    pub fn clear(&self) {
        let drained: Vec<T> = self.items.lock().drain(..).collect();
        drop(drained);
    }

    /// Wake every consumer and refuse further pops
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.clear();
        self.notify.notify_waiters();
    }
}

/// A packet shared between a worker and the sequential stage
pub struct Element<T> {
    slot: Arc<tokio::sync::Mutex<T>>,
    dropped: AtomicBool,
}

impl<T> Element<T> {
    /// Create an element whose lock is already held by the returned job
    pub async fn new_locked(value: T) -> (Arc<Self>, Job<T>) {
        let slot = Arc::new(tokio::sync::Mutex::new(value));
        let guard = slot.clone().lock_owned().await;
        let element = Arc::new(Self {
            slot,
            dropped: AtomicBool::new(false),
        });
        let job = Job {
            element: element.clone(),
            guard: Some(guard),
        };
        (element, job)
    }

    pub fn mark_dropped(&self) {
        self.dropped.store(true, Ordering::Release);
    }

    pub fn is_dropped(&self) -> bool {
        self.dropped.load(Ordering::Acquire)
    }

    /// Wait for the worker to finish with this element
    pub async fn lock(&self) -> MutexGuard<'_, T> {
        self.slot.lock().await
    }
}

/// Worker-side handle of an [`Element`].
///
/// Dropping a job without calling [`Job::complete`] marks the element as
/// dropped before its lock is released.
pub struct Job<T> {
    element: Arc<Element<T>>,
    guard: Option<OwnedMutexGuard<T>>,
}

impl<T> Job<T> {
    pub fn data(&mut self) -> Option<&mut T> {
        self.guard.as_deref_mut()
    }

    /// The sequential stage already gave up on this element
    pub fn is_dropped(&self) -> bool {
        self.element.is_dropped()
    }

    /// Hand the element to the sequential stage
    pub fn complete(mut self) {
        self.guard.take();
    }
}

impl<T> Drop for Job<T> {
    fn drop(&mut self) {
        if let Some(guard) = self.guard.take() {
            self.element.mark_dropped();
            drop(guard);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_overflow_evicts_oldest_and_releases_it() {
        let queue = DropQueue::new(2);
        let (first, first_job) = Element::new_locked(1u32).await;
        let (_, second_job) = Element::new_locked(2u32).await;
        let (_, third_job) = Element::new_locked(3u32).await;

        assert!(queue.push(first_job).is_none());
        assert!(queue.push(second_job).is_none());

        let evicted = queue.push(third_job).expect("oldest evicted");
        assert_eq!(queue.len(), 2);
        drop(evicted);

        assert!(first.is_dropped());
        let value = tokio::time::timeout(Duration::from_secs(1), first.lock())
            .await
            .expect("lock released");
        assert_eq!(*value, 1);

        let mut next = queue.pop().await.unwrap();
        assert_eq!(next.data().copied(), Some(2));
    }

    #[tokio::test]
    async fn test_completed_job_is_not_dropped() {
        let (element, mut job) = Element::new_locked(Vec::<u8>::new()).await;
        job.data().unwrap().extend_from_slice(b"ok");
        job.complete();

        assert!(!element.is_dropped());
        assert_eq!(&*element.lock().await, b"ok");
    }

    #[tokio::test]
    async fn test_pop_waits_for_push() {
        let queue = Arc::new(DropQueue::new(4));
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.push(7u8);
        assert_eq!(consumer.await.unwrap(), Some(7));
    }

    #[tokio::test]
    async fn test_close_wakes_consumers() {
        let queue = Arc::new(DropQueue::<u8>::new(4));
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.close();
        let popped = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .unwrap()
            .unwrap();
        assert!(popped.is_none());
    }
}
