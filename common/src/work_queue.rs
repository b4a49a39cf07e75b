//! Multi-producer multi-consumer FIFO with a sticky "closed" flag.
//!
//! The only locked structure shared between threads: scanners push, workers
//! pop. `wait_pop` returns None exactly when the queue is closed and empty,
//! which doubles as the worker shutdown signal.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

struct Inner<T> {
    queue: VecDeque<T>,
    closed: bool,
}

pub struct WorkQueue<T> {
    inner: Mutex<Inner<T>>,
    cond: Condvar,
}

impl<T> WorkQueue<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                closed: false,
            }),
            cond: Condvar::new(),
        }
    }

    pub fn push(&self, item: T) {
        let mut inner = self.inner.lock().unwrap();
        inner.queue.push_back(item);
        drop(inner);
        self.cond.notify_one();
    }

    /// Requeue at the front; used when a worker could not admit an item
    /// (no free buffer) and wants it retried before fresh work.
    pub fn push_front(&self, item: T) {
        let mut inner = self.inner.lock().unwrap();
        inner.queue.push_front(item);
        drop(inner);
        self.cond.notify_one();
    }

    /// All items become visible atomically with respect to other producers.
    pub fn push_bulk(&self, items: impl IntoIterator<Item = T>) {
        let mut inner = self.inner.lock().unwrap();
        inner.queue.extend(items);
        drop(inner);
        self.cond.notify_all();
    }

    pub fn try_pop(&self) -> Option<T> {
        self.inner.lock().unwrap().queue.pop_front()
    }

    /// Block until an item is available or the queue is closed and empty.
    pub fn wait_pop(&self) -> Option<T> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if let Some(item) = inner.queue.pop_front() {
                return Some(item);
            }
            if inner.closed {
                return None;
            }
            inner = self.cond.wait(inner).unwrap();
        }
    }

    /// No more items will be pushed (requeues via `push_front` excepted).
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.closed = true;
        drop(inner);
        self.cond.notify_all();
    }

    /// Closed and drained.
    pub fn is_done(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.closed && inner.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for WorkQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn fifo_order() {
        let q = WorkQueue::new();
        q.push(1);
        q.push(2);
        q.push(3);
        assert_eq!(q.try_pop(), Some(1));
        assert_eq!(q.try_pop(), Some(2));
        assert_eq!(q.try_pop(), Some(3));
        assert_eq!(q.try_pop(), None);
    }

    #[test]
    fn push_front_jumps_the_line() {
        let q = WorkQueue::new();
        q.push(1);
        q.push(2);
        q.push_front(0);
        assert_eq!(q.try_pop(), Some(0));
        assert_eq!(q.try_pop(), Some(1));
    }

    #[test]
    fn wait_pop_returns_none_after_close() {
        let q: Arc<WorkQueue<u32>> = Arc::new(WorkQueue::new());
        let q2 = q.clone();
        let handle = std::thread::spawn(move || q2.wait_pop());
        std::thread::sleep(std::time::Duration::from_millis(20));
        q.close();
        assert_eq!(handle.join().unwrap(), None);
        assert!(q.is_done());
    }

    #[test]
    fn close_drains_remaining_items_first() {
        let q = WorkQueue::new();
        q.push_bulk(vec![1, 2]);
        q.close();
        assert!(!q.is_done());
        assert_eq!(q.wait_pop(), Some(1));
        assert_eq!(q.wait_pop(), Some(2));
        assert_eq!(q.wait_pop(), None);
        assert!(q.is_done());
    }

    #[test]
    fn bulk_push_is_visible_in_order() {
        let q = WorkQueue::new();
        q.push_bulk(0..100);
        for want in 0..100 {
            assert_eq!(q.try_pop(), Some(want));
        }
    }

    #[test]
    fn many_consumers_drain_everything() {
        let q: Arc<WorkQueue<u64>> = Arc::new(WorkQueue::new());
        q.push_bulk(0..1000u64);
        q.close();
        let mut handles = Vec::new();
        for _ in 0..4 {
            let q = q.clone();
            handles.push(std::thread::spawn(move || {
                let mut sum = 0u64;
                while let Some(v) = q.wait_pop() {
                    sum += v;
                }
                sum
            }));
        }
        let total: u64 = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(total, 999 * 1000 / 2);
    }
}
