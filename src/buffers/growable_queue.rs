use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use tracing::trace;
use crate::buffers::ring_queue::ConcurrentRingQueue;

/// An unbounded MPMC queue: a lock-free ring for the common case, with a mutex protected overflow
///  list that is used while the ring is full.
///
/// Once a value went to the overflow list, all subsequent values go there too until consumers
///  drained it completely. That keeps FIFO order per producer. Growth is unbounded, so callers
///  must make sure that consumers keep up.
pub struct GrowableQueue<T> {
    ring: ConcurrentRingQueue<T>,
    overflow: Mutex<VecDeque<T>>,
    overflowing: AtomicBool,
    overflow_len: AtomicUsize,
}

impl<T> GrowableQueue<T> {
    pub fn new(ring_capacity: usize) -> GrowableQueue<T> {
        GrowableQueue {
            ring: ConcurrentRingQueue::new(ring_capacity),
            overflow: Default::default(),
            overflowing: AtomicBool::new(false),
            overflow_len: AtomicUsize::new(0),
        }
    }

    pub fn push(&self, value: T) {
        let value = if self.overflowing.load(Ordering::Acquire) {
            value
        }
        else {
            match self.ring.try_add(value) {
                Ok(()) => return,
                Err(v) => v,
            }
        };

        let mut overflow = self.overflow.lock().unwrap();
        if !self.overflowing.load(Ordering::Acquire) {
            // a consumer may have emptied the ring in the meantime
            trace!("ring queue is full, switching to overflow list");
            self.overflowing.store(true, Ordering::Release);
        }
        overflow.push_back(value);
        self.overflow_len.store(overflow.len(), Ordering::Release);
    }

    pub fn pop(&self) -> Option<T> {
        if let Some(v) = self.ring.try_take() {
            return Some(v);
        }
        if !self.overflowing.load(Ordering::Acquire) {
            return None;
        }

        let mut overflow = self.overflow.lock().unwrap();
        // values pushed to the ring before the switch come first
        if let Some(v) = self.ring.try_take() {
            return Some(v);
        }
        let result = overflow.pop_front();
        if overflow.is_empty() {
            self.overflowing.store(false, Ordering::Release);
        }
        self.overflow_len.store(overflow.len(), Ordering::Release);
        result
    }

    /// Racy snapshot of the number of queued values
    pub fn len(&self) -> usize {
        self.ring.len() + self.overflow_len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn drain(&self) -> Vec<T> {
        let mut result = Vec::new();
        while let Some(v) = self.pop() {
            result.push(v);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use super::*;

    #[test]
    fn test_grows_beyond_ring() {
        let queue = GrowableQueue::new(2);
        for i in 0..10 {
            queue.push(i);
        }
        assert_eq!(queue.len(), 10);
        assert_eq!(queue.drain(), (0..10).collect::<Vec<_>>());
        assert!(queue.is_empty());
        assert!(!queue.overflowing.load(Ordering::Acquire));
    }

    #[test]
    fn test_returns_to_ring_after_overflow() {
        let queue = GrowableQueue::new(2);
        queue.push(1);
        queue.push(2);
        queue.push(3);
        assert_eq!(queue.pop(), Some(1));
        // still overflowing: goes behind 3
        queue.push(4);
        assert_eq!(queue.drain(), vec![2, 3, 4]);

        queue.push(5);
        assert_eq!(queue.ring.len(), 1);
        assert_eq!(queue.pop(), Some(5));
    }

    #[test]
    fn test_concurrent_per_producer_fifo() {
        const PER_PRODUCER: usize = 20_000;
        let queue = Arc::new(GrowableQueue::new(4));

        let producers = (0..3)
            .map(|p| {
                let queue = queue.clone();
                thread::spawn(move || {
                    for i in 0..PER_PRODUCER {
                        queue.push((p, i));
                    }
                })
            })
            .collect::<Vec<_>>();

        let mut next = [0usize; 3];
        let mut received = 0;
        while received < 3 * PER_PRODUCER {
            match queue.pop() {
                Some((p, i)) => {
                    assert_eq!(i, next[p], "producer {} out of order", p);
                    next[p] += 1;
                    received += 1;
                }
                None => thread::yield_now(),
            }
        }
        for p in producers {
            p.join().unwrap();
        }
        assert!(queue.is_empty());
    }
}
