use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::{debug, trace};
use crate::buffers::pooled_buffer::PooledBuffer;
use crate::buffers::ring_queue::ConcurrentRingQueue;
use crate::config::TransportConfig;

/// Counters for buffer pool activity. The values are snapshots of independent atomic counters,
///  so they are not necessarily consistent with each other while the pool is in use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// buffers that were newly allocated because no pooled buffer was available
    pub allocated: u64,
    /// buffers that were handed out from the pool
    pub reused: u64,
    /// buffers that were returned to the pool
    pub recycled: u64,
    /// buffers that were dropped on return, either because they are not of a pooled size or
    ///  because their size class was full
    pub discarded: u64,
}

/// A pool of reusable byte buffers with size classes.
///
/// The 'regular' class holds MTU sized buffers. It is by far the most frequently used class, and
///  it has a big capacity. It also serves all requests smaller than the MTU, so the MTU is a floor
///  for pooled buffer sizes rather than a lower bound for pooling. Bigger requests are served from *levels* of buffers with size
///  `mtu * 2^(level+1)`, each with a small capacity. Requests beyond the biggest level are
///  allocated directly and never pooled.
///
/// All size classes are lock-free ring queues, so buffers can be borrowed and returned from any
///  thread without blocking.
#[derive(Debug)]
pub struct BufferPool {
    mtu: usize,
    regular: ConcurrentRingQueue<Box<[u8]>>,
    levels: Vec<ConcurrentRingQueue<Box<[u8]>>>,

    allocated: AtomicU64,
    reused: AtomicU64,
    recycled: AtomicU64,
    discarded: AtomicU64,
}

impl BufferPool {
    pub fn new(mtu: usize, regular_capacity: usize, num_levels: usize, level_capacity: usize) -> BufferPool {
        assert!(mtu > 0);
        BufferPool {
            mtu,
            regular: ConcurrentRingQueue::new(regular_capacity.max(1)),
            levels: (0..num_levels)
                .map(|_| ConcurrentRingQueue::new(level_capacity.max(1)))
                .collect(),
            allocated: Default::default(),
            reused: Default::default(),
            recycled: Default::default(),
            discarded: Default::default(),
        }
    }

    pub fn from_config(config: &TransportConfig) -> Arc<BufferPool> {
        Arc::new(BufferPool::new(config.mtu, config.pool_mtu_capacity, config.pool_levels, config.pool_level_capacity))
    }

    /// A process-wide pool with default settings
    pub fn global() -> Arc<BufferPool> {
        static GLOBAL: OnceLock<Arc<BufferPool>> = OnceLock::new();
        GLOBAL.get_or_init(|| BufferPool::from_config(&TransportConfig::default()))
            .clone()
    }

    pub fn mtu(&self) -> usize {
        self.mtu
    }

    /// the size of the biggest pooled buffers
    pub fn max_pooled_size(&self) -> usize {
        self.level_size(self.levels.len())
    }

    fn level_size(&self, level: usize) -> usize {
        // level 0 is the regular class
        self.mtu << level
    }

    /// size class index for a requested minimum size: 0 for regular buffers, `k` for level
    ///  `k-1`, `None` if the request is beyond all pooled sizes
    fn class_for_request(&self, min_size: usize) -> Option<usize> {
        (0..=self.levels.len())
            .find(|&class| self.level_size(class) >= min_size)
    }

    fn class_queue(&self, class: usize) -> &ConcurrentRingQueue<Box<[u8]>> {
        if class == 0 {
            &self.regular
        }
        else {
            &self.levels[class - 1]
        }
    }

    /// Returns an empty buffer with a capacity of at least `min_size`. The buffer returns itself
    ///  to this pool when it is dropped.
    pub fn get_buffer(self: &Arc<Self>, min_size: usize) -> PooledBuffer {
        PooledBuffer::new(self.clone(), self.get_raw(min_size))
    }

    pub(crate) fn get_raw(&self, min_size: usize) -> Box<[u8]> {
        match self.class_for_request(min_size) {
            Some(class) => {
                if let Some(buf) = self.class_queue(class).try_take() {
                    trace!(size = buf.len(), "reusing pooled buffer");
                    self.reused.fetch_add(1, Ordering::Relaxed);
                    return buf;
                }
                trace!(size = self.level_size(class), "no buffer in pool: allocating new buffer");
                self.allocated.fetch_add(1, Ordering::Relaxed);
                vec![0; self.level_size(class)].into_boxed_slice()
            }
            None => {
                debug!(min_size, "requested size exceeds all size classes: allocating unpooled buffer");
                self.allocated.fetch_add(1, Ordering::Relaxed);
                vec![0; min_size].into_boxed_slice()
            }
        }
    }

    pub(crate) fn recycle(&self, buf: Box<[u8]>) {
        let class = (0..=self.levels.len())
            .find(|&class| self.level_size(class) == buf.len());

        let Some(class) = class else {
            trace!(size = buf.len(), "buffer does not match a size class: discarding");
            self.discarded.fetch_add(1, Ordering::Relaxed);
            return;
        };

        match self.class_queue(class).try_add(buf) {
            Ok(()) => {
                trace!("returning buffer to pool");
                self.recycled.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                debug!("pool is full: discarding returned buffer");
                self.discarded.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            allocated: self.allocated.load(Ordering::Relaxed),
            reused: self.reused.load(Ordering::Relaxed),
            recycled: self.recycled.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use bytes::BufMut;
    use rstest::rstest;
    use super::*;

    fn pool() -> Arc<BufferPool> {
        Arc::new(BufferPool::new(100, 4, 3, 2))
    }

    #[rstest]
    #[case::empty(0, 100)]
    #[case::small(1, 100)]
    #[case::mtu(100, 100)]
    #[case::level_0(101, 200)]
    #[case::level_1(399, 400)]
    #[case::level_2(800, 800)]
    #[case::unpooled(801, 801)]
    fn test_size_classes(#[case] requested: usize, #[case] expected_capacity: usize) {
        let pool = pool();
        let buf = pool.get_buffer(requested);
        assert_eq!(buf.capacity(), expected_capacity);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_reuse() {
        let pool = pool();
        let mut buf = pool.get_buffer(10);
        buf.put_slice(b"abc");
        drop(buf);
        assert_eq!(pool.stats(), PoolStats { allocated: 1, reused: 0, recycled: 1, discarded: 0 });

        let buf = pool.get_buffer(50);
        assert!(buf.is_empty());
        assert_eq!(pool.stats(), PoolStats { allocated: 1, reused: 1, recycled: 1, discarded: 0 });
    }

    #[test]
    fn test_sub_mtu_buffers_serve_mtu_requests() {
        let pool = pool();
        drop(pool.get_buffer(1));
        let buf = pool.get_buffer(100);
        assert_eq!(buf.capacity(), 100);
        assert_eq!(pool.stats(), PoolStats { allocated: 1, reused: 1, recycled: 1, discarded: 0 });
    }

    #[test]
    fn test_unpooled_is_discarded() {
        let pool = pool();
        drop(pool.get_buffer(5000));
        assert_eq!(pool.stats(), PoolStats { allocated: 1, reused: 0, recycled: 0, discarded: 1 });
    }

    #[test]
    fn test_full_class_discards() {
        let pool = pool();
        let buffers = (0..6).map(|_| pool.get_buffer(10)).collect::<Vec<_>>();
        drop(buffers);
        let stats = pool.stats();
        assert_eq!(stats.recycled, 4);
        assert_eq!(stats.discarded, 2);
    }

    #[test]
    fn test_shared_buffer_returns_once() {
        let pool = pool();
        let mut buf = pool.get_buffer(10);
        buf.put_slice(b"hello");
        let shared = buf.freeze();
        let clones = (0..10).map(|_| shared.clone()).collect::<Vec<_>>();
        drop(shared);
        assert_eq!(pool.stats().recycled, 0);

        let handles = clones.into_iter()
            .map(|c| thread::spawn(move || assert_eq!(c.as_ref(), b"hello")))
            .collect::<Vec<_>>();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(pool.stats().recycled, 1);
    }
}
