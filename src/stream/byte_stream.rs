use std::collections::VecDeque;
use std::pin::pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use anyhow::bail;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::trace;
use crate::buffers::buffer_pool::BufferPool;
use crate::buffers::growable_queue::GrowableQueue;
use crate::buffers::pooled_buffer::{BufferSpan, PooledBuffer};

/// A byte pipe between a writer (typically a connection task) and a reader (typically a
///  `DataSplitter`), made of pooled buffer chunks.
///
/// Writes never block and never apply backpressure. Reads consume from the front and return
///  whatever is buffered, waiting for data up to a timeout if there is none. Closing is idempotent,
///  and it wakes all waiting readers; once a closed stream is drained, reads return 0 right away.
///
/// Any number of tasks may read and write concurrently, but concurrent reads interleave at chunk
///  granularity, so the intended use is a single reader and a single writer.
pub struct ByteStream {
    pool: Arc<BufferPool>,
    chunks: GrowableQueue<BufferSpan>,
    buffered: AtomicUsize,
    closed: AtomicBool,
    notify: Notify,
    reader: Mutex<VecDeque<BufferSpan>>,
}

impl ByteStream {
    pub fn new(pool: Arc<BufferPool>) -> ByteStream {
        ByteStream {
            pool,
            chunks: GrowableQueue::new(256),
            buffered: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            notify: Notify::new(),
            reader: Default::default(),
        }
    }

    /// Copies `data` into pooled buffers and appends them
    pub fn write(&self, mut data: &[u8]) -> anyhow::Result<()> {
        if self.is_closed() {
            bail!("write to closed stream");
        }

        let chunk_size = self.pool.mtu();
        while !data.is_empty() {
            let n = data.len().min(chunk_size);
            let mut buf = self.pool.get_buffer(n);
            buf.spare_mut()[..n].copy_from_slice(&data[..n]);
            buf.commit(n);
            self.enqueue(buf.freeze().full_span());
            data = &data[n..];
        }
        self.notify.notify_waiters();
        Ok(())
    }

    /// Appends an existing span without copying
    pub fn write_span(&self, span: BufferSpan) -> anyhow::Result<()> {
        if self.is_closed() {
            bail!("write to closed stream");
        }
        if !span.is_empty() {
            self.enqueue(span);
            self.notify.notify_waiters();
        }
        Ok(())
    }

    fn enqueue(&self, span: BufferSpan) {
        // count first so that concurrent reads never make the counter drop below zero
        self.buffered.fetch_add(span.len(), Ordering::AcqRel);
        self.chunks.push(span);
    }

    /// number of bytes that can be read without waiting
    pub fn available(&self) -> usize {
        self.buffered.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            trace!("closing byte stream");
        }
        self.notify.notify_waiters();
    }

    fn with_reader<R>(&self, f: impl FnOnce(&mut VecDeque<BufferSpan>) -> R) -> R {
        let mut front = self.reader.lock().unwrap();
        while let Some(span) = self.chunks.pop() {
            front.push_back(span);
        }
        f(&mut front)
    }

    /// Copies up to `dest.len()` bytes from the front of the stream without consuming them.
    ///  Returns the number of bytes copied.
    pub fn peek(&self, dest: &mut [u8]) -> usize {
        self.with_reader(|front| {
            let mut copied = 0;
            for span in front.iter() {
                if copied == dest.len() {
                    break;
                }
                let n = span.len().min(dest.len() - copied);
                dest[copied..copied + n].copy_from_slice(&span.as_ref()[..n]);
                copied += n;
            }
            copied
        })
    }

    /// Discards up to `n` bytes, returning the number of bytes discarded
    pub fn skip(&self, n: usize) -> usize {
        self.with_reader(|front| {
            let mut skipped = 0;
            while skipped < n {
                let Some(span) = front.front_mut() else { break };
                let k = span.len().min(n - skipped);
                span.advance(k);
                skipped += k;
                if span.is_empty() {
                    front.pop_front();
                }
            }
            self.buffered.fetch_sub(skipped, Ordering::AcqRel);
            skipped
        })
    }

    /// Reads up to `dest.len()` bytes without waiting
    pub fn try_read(&self, dest: &mut [u8]) -> usize {
        self.with_reader(|front| {
            let mut copied = 0;
            while copied < dest.len() {
                let Some(span) = front.front_mut() else { break };
                let n = span.len().min(dest.len() - copied);
                dest[copied..copied + n].copy_from_slice(&span.as_ref()[..n]);
                span.advance(n);
                copied += n;
                if span.is_empty() {
                    front.pop_front();
                }
            }
            self.buffered.fetch_sub(copied, Ordering::AcqRel);
            copied
        })
    }

    /// Appends up to `n` bytes to `dest` without waiting, returning the number of bytes moved
    pub fn try_read_into(&self, dest: &mut PooledBuffer, n: usize) -> usize {
        dest.ensure_capacity(dest.len() + n);
        let copied = self.try_read(&mut dest.spare_mut()[..n]);
        dest.commit(copied);
        copied
    }

    /// Waits until at least `min` bytes are buffered or the stream is closed, for at most
    ///  `timeout`. Returns `true` if the bytes are available.
    pub async fn wait_available(&self, min: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let mut notified = pin!(self.notify.notified());
            notified.as_mut().enable();

            if self.available() >= min {
                return true;
            }
            if self.is_closed() {
                return false;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.available() >= min;
            }
        }
    }

    /// Reads at least one byte, waiting for at most `timeout`. Returns 0 if the timeout expired
    ///  or the stream is closed and drained.
    pub async fn read(&self, dest: &mut [u8], timeout: Duration) -> usize {
        if dest.is_empty() {
            return 0;
        }
        self.wait_available(1, timeout).await;
        self.try_read(dest)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;
    use super::*;

    fn stream() -> Arc<ByteStream> {
        Arc::new(ByteStream::new(Arc::new(BufferPool::new(8, 16, 2, 2))))
    }

    #[test]
    fn test_write_read() {
        let stream = stream();
        stream.write(b"hello, world!").unwrap();
        assert_eq!(stream.available(), 13);

        let mut buf = [0u8; 5];
        assert_eq!(stream.peek(&mut buf), 5);
        assert_eq!(&buf, b"hello");
        assert_eq!(stream.available(), 13);

        assert_eq!(stream.skip(7), 7);
        let mut buf = [0u8; 32];
        let n = stream.try_read(&mut buf);
        assert_eq!(&buf[..n], b"world!");
        assert_eq!(stream.available(), 0);
        assert_eq!(stream.try_read(&mut buf), 0);
    }

    #[test]
    fn test_peek_across_chunks() {
        let stream = stream();
        stream.write(b"abc").unwrap();
        stream.write(b"defghijklmno").unwrap();

        let mut buf = [0u8; 10];
        assert_eq!(stream.peek(&mut buf), 10);
        assert_eq!(&buf, b"abcdefghij");
    }

    #[test]
    fn test_write_after_close() {
        let stream = stream();
        stream.close();
        stream.close();
        assert!(stream.write(b"x").is_err());
    }

    #[test]
    fn test_try_read_into() {
        let stream = stream();
        stream.write(b"0123456789").unwrap();
        let mut buf = BufferPool::global().get_buffer(4);
        assert_eq!(stream.try_read_into(&mut buf, 6), 6);
        assert_eq!(stream.try_read_into(&mut buf, 10), 4);
        assert_eq!(buf.as_ref(), b"0123456789");
    }

    #[tokio::test]
    async fn test_read_waits_for_data() {
        let stream = stream();
        let writer = stream.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer.write(b"late").unwrap();
        });

        let mut buf = [0u8; 16];
        let n = stream.read(&mut buf, Duration::from_secs(5)).await;
        assert_eq!(&buf[..n], b"late");
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_timeout() {
        let stream = stream();
        let mut buf = [0u8; 16];
        let start = Instant::now();
        assert_eq!(stream.read(&mut buf, Duration::from_millis(100)).await, 0);
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_close_wakes_readers() {
        let stream = stream();
        let readers = (0..3)
            .map(|_| {
                let stream = stream.clone();
                tokio::spawn(async move {
                    let mut buf = [0u8; 4];
                    stream.read(&mut buf, Duration::from_secs(60)).await
                })
            })
            .collect::<Vec<_>>();

        tokio::time::sleep(Duration::from_millis(10)).await;
        stream.close();
        for r in readers {
            assert_eq!(r.await.unwrap(), 0);
        }
    }

    #[tokio::test]
    async fn test_wait_available() {
        let stream = stream();
        stream.write(b"ab").unwrap();
        assert!(!stream.wait_available(3, Duration::from_millis(10)).await);
        stream.write(b"c").unwrap();
        assert!(stream.wait_available(3, Duration::from_millis(10)).await);
    }
}
