//! A bounded, lock-free multi-producer / multi-consumer queue.
//!
//! The queue is an array of slots plus two monotonically increasing cursors, `tail` for producers
//!  and `head` for consumers. Each slot carries a *stamp* that doubles as its 'ready' flag:
//!
//! * `stamp == pos` - the slot is free for the producer claiming position `pos`
//! * `stamp == pos + 1` - the producer for `pos` finished writing, a consumer may take it
//! * `stamp == pos + capacity` - the consumer for `pos` is done, the slot is free for the
//!    producer of the next lap
//!
//! Producers and consumers claim positions by compare-and-swap on their cursor and then
//!  publish through the slot's stamp. A producer that claimed a slot but did not write it yet
//!  makes consumers of *that* slot see an empty queue, it never lets them observe a
//!  half-written value.

use std::cell::UnsafeCell;
use std::fmt::{Debug, Formatter};
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};

struct Slot<T> {
    stamp: AtomicUsize,
    value: UnsafeCell<MaybeUninit<T>>,
}

pub struct ConcurrentRingQueue<T> {
    slots: Box<[Slot<T>]>,
    head: AtomicUsize,
    tail: AtomicUsize,
}

// Values are moved in and out under the stamp protocol, never shared
unsafe impl<T: Send> Send for ConcurrentRingQueue<T> {}
unsafe impl<T: Send> Sync for ConcurrentRingQueue<T> {}

impl<T> ConcurrentRingQueue<T> {
    pub fn new(capacity: usize) -> ConcurrentRingQueue<T> {
        assert!(capacity > 0, "ring queue capacity must be positive");

        let slots = (0..capacity)
            .map(|i| Slot {
                stamp: AtomicUsize::new(i),
                value: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();

        ConcurrentRingQueue {
            slots,
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Adds a value if there is room, handing it back otherwise. This never blocks.
    pub fn try_add(&self, value: T) -> Result<(), T> {
        let mut pos = self.tail.load(Ordering::Relaxed);
        loop {
            let slot = &self.slots[pos % self.capacity()];
            let stamp = slot.stamp.load(Ordering::Acquire);

            if stamp == pos {
                match self.tail.compare_exchange_weak(pos, pos.wrapping_add(1), Ordering::Relaxed, Ordering::Relaxed) {
                    Ok(_) => {
                        unsafe { (*slot.value.get()).write(value); }
                        slot.stamp.store(pos.wrapping_add(1), Ordering::Release);
                        return Ok(());
                    }
                    Err(actual) => pos = actual,
                }
            }
            else if (stamp.wrapping_sub(pos) as isize) < 0 {
                // the slot still holds the previous lap's value
                return Err(value);
            }
            else {
                pos = self.tail.load(Ordering::Relaxed);
            }
        }
    }

    /// Takes the oldest value, returning `None` if the queue is empty. This never blocks.
    pub fn try_take(&self) -> Option<T> {
        let mut pos = self.head.load(Ordering::Relaxed);
        loop {
            let slot = &self.slots[pos % self.capacity()];
            let stamp = slot.stamp.load(Ordering::Acquire);
            let expected = pos.wrapping_add(1);

            if stamp == expected {
                match self.head.compare_exchange_weak(pos, expected, Ordering::Relaxed, Ordering::Relaxed) {
                    Ok(_) => {
                        let value = unsafe { (*slot.value.get()).assume_init_read() };
                        slot.stamp.store(pos.wrapping_add(self.capacity()), Ordering::Release);
                        return Some(value);
                    }
                    Err(actual) => pos = actual,
                }
            }
            else if (stamp.wrapping_sub(expected) as isize) < 0 {
                return None;
            }
            else {
                pos = self.head.load(Ordering::Relaxed);
            }
        }
    }

    /// Number of claimed slots. This is a racy snapshot: it includes values that producers are
    ///  still in the process of writing, and it may be outdated by the time the caller looks at it.
    pub fn len(&self) -> usize {
        loop {
            let tail = self.tail.load(Ordering::SeqCst);
            let head = self.head.load(Ordering::SeqCst);
            if self.tail.load(Ordering::SeqCst) == tail {
                return tail.wrapping_sub(head).min(self.capacity());
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() == self.capacity()
    }

    /// Takes all values that are available right now. Like `len()`, this is a snapshot that
    ///  concurrent producers and consumers may invalidate while it runs.
    pub fn drain(&self) -> Vec<T> {
        let mut result = Vec::new();
        while let Some(v) = self.try_take() {
            result.push(v);
        }
        result
    }
}

impl<T> Drop for ConcurrentRingQueue<T> {
    fn drop(&mut self) {
        while self.try_take().is_some() {}
    }
}

impl<T> Debug for ConcurrentRingQueue<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrentRingQueue")
            .field("capacity", &self.capacity())
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;
    use rstest::rstest;
    use super::*;

    #[test]
    fn test_fifo() {
        let queue = ConcurrentRingQueue::new(4);
        assert!(queue.is_empty());
        for i in 0..4 {
            queue.try_add(i).unwrap();
        }
        assert!(queue.is_full());
        assert_eq!(queue.try_add(99), Err(99));

        assert_eq!(queue.try_take(), Some(0));
        queue.try_add(4).unwrap();
        assert_eq!(queue.drain(), vec![1, 2, 3, 4]);
        assert_eq!(queue.try_take(), None);
    }

    #[rstest]
    #[case(1)]
    #[case(3)]
    #[case(7)]
    fn test_wraps_around(#[case] capacity: usize) {
        let queue = ConcurrentRingQueue::new(capacity);
        for lap in 0..10 {
            for i in 0..capacity {
                queue.try_add(lap * 100 + i).unwrap();
            }
            assert!(queue.try_add(usize::MAX).is_err());
            for i in 0..capacity {
                assert_eq!(queue.try_take(), Some(lap * 100 + i));
            }
            assert!(queue.try_take().is_none());
        }
    }

    #[test]
    fn test_drop_releases_values() {
        let marker = Arc::new(());
        {
            let queue = ConcurrentRingQueue::new(8);
            for _ in 0..5 {
                queue.try_add(marker.clone()).unwrap();
            }
            assert_eq!(Arc::strong_count(&marker), 6);
        }
        assert_eq!(Arc::strong_count(&marker), 1);
    }

    #[rstest]
    #[case::tiny(2, 4, 4)]
    #[case::small(16, 4, 4)]
    #[case::many_producers(64, 8, 2)]
    fn test_concurrent_no_loss_no_duplicates(#[case] capacity: usize, #[case] producers: usize, #[case] consumers: usize) {
        const PER_PRODUCER: usize = 10_000;

        let queue = Arc::new(ConcurrentRingQueue::new(capacity));
        let producer_handles = (0..producers)
            .map(|p| {
                let queue = queue.clone();
                thread::spawn(move || {
                    for i in 0..PER_PRODUCER {
                        let mut value = p * PER_PRODUCER + i;
                        loop {
                            match queue.try_add(value) {
                                Ok(()) => break,
                                Err(v) => {
                                    value = v;
                                    thread::yield_now();
                                }
                            }
                        }
                    }
                })
            })
            .collect::<Vec<_>>();

        let total = producers * PER_PRODUCER;
        let taken = Arc::new(AtomicUsize::new(0));
        let consumer_handles = (0..consumers)
            .map(|_| {
                let queue = queue.clone();
                let taken = taken.clone();
                thread::spawn(move || {
                    let mut result = Vec::new();
                    while taken.load(Ordering::SeqCst) < total {
                        if let Some(v) = queue.try_take() {
                            taken.fetch_add(1, Ordering::SeqCst);
                            result.push(v);
                        }
                        else {
                            thread::yield_now();
                        }
                    }
                    result
                })
            })
            .collect::<Vec<_>>();

        for h in producer_handles {
            h.join().unwrap();
        }
        let mut seen = HashSet::new();
        for h in consumer_handles {
            for v in h.join().unwrap() {
                assert!(seen.insert(v), "value {} was taken twice", v);
            }
        }
        assert_eq!(seen.len(), total);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_per_producer_order() {
        let queue = Arc::new(ConcurrentRingQueue::new(8));
        let producers = (0..2)
            .map(|p| {
                let queue = queue.clone();
                thread::spawn(move || {
                    for i in 0..5_000usize {
                        while queue.try_add((p, i)).is_err() {
                            thread::yield_now();
                        }
                    }
                })
            })
            .collect::<Vec<_>>();

        let mut last = [None, None];
        let mut count = 0;
        while count < 10_000 {
            if let Some((p, i)) = queue.try_take() {
                if let Some(prev) = last[p] {
                    assert!(i > prev);
                }
                last[p] = Some(i);
                count += 1;
            }
        }
        for p in producers {
            p.join().unwrap();
        }
    }
}
