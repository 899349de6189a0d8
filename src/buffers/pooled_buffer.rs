//! Buffers borrowed from a `BufferPool`.
//!
//! * `PooledBuffer` is the exclusively owned, writable form. It is move-only and returns its
//!    memory to the pool when dropped, so there is no way to release it twice or to use it
//!    after release.
//! * `SharedBuffer` is the frozen, read-only form with shared ownership. Cloning it is the
//!    equivalent of adding a reference, dropping it releases one, and the last one returns the
//!    memory to the pool. Since it is read-only, a buffer can not be mutated once it is shared.
//! * `BufferSpan` is a view of part of a shared buffer. Spans keep the whole buffer alive.
//! * `SliceBuf` is a limited-lifetime writable view of the tail of a `PooledBuffer`, used by
//!    code that should only see a message's payload and not its header.

use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use bytes::buf::UninitSlice;
use crate::buffers::buffer_pool::BufferPool;

pub struct PooledBuffer {
    // this is only ever `None` after the buffer was taken out in `drop()`
    buf: Option<Box<[u8]>>,
    len: usize,
    pool: Arc<BufferPool>,
}

impl PooledBuffer {
    pub(crate) fn new(pool: Arc<BufferPool>, buf: Box<[u8]>) -> PooledBuffer {
        PooledBuffer {
            buf: Some(buf),
            len: 0,
            pool,
        }
    }

    fn raw(&self) -> &[u8] {
        self.buf.as_deref().unwrap_or(&[])
    }

    fn raw_mut(&mut self) -> &mut [u8] {
        self.buf.as_deref_mut().unwrap_or(&mut [])
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.raw().len()
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }

    pub fn truncate(&mut self, len: usize) {
        self.len = self.len.min(len);
    }

    /// Sets the length to `len`, growing the buffer if necessary. Bytes between the old and the
    ///  new length have unspecified (but initialized) content.
    pub fn resize(&mut self, len: usize) {
        self.ensure_capacity(len);
        self.len = len;
    }

    /// The buffer's unused tail, for reading data into it. Call `commit()` afterwards.
    pub fn spare_mut(&mut self) -> &mut [u8] {
        let len = self.len;
        &mut self.raw_mut()[len..]
    }

    /// Marks `n` bytes of the spare tail as filled
    pub fn commit(&mut self, n: usize) {
        assert!(self.len + n <= self.capacity());
        self.len += n;
    }

    /// Makes sure that the buffer can hold at least `min_capacity` bytes, replacing the backing
    ///  array with a bigger one from the pool if necessary.
    pub fn ensure_capacity(&mut self, min_capacity: usize) {
        if min_capacity <= self.capacity() {
            return;
        }

        let target = min_capacity.max(2 * self.capacity());
        let mut bigger = self.pool.get_raw(target);
        bigger[..self.len].copy_from_slice(&self.raw()[..self.len]);
        if let Some(old) = self.buf.replace(bigger) {
            self.pool.recycle(old);
        }
    }

    pub fn freeze(self) -> SharedBuffer {
        SharedBuffer(Arc::new(self))
    }

    ///create a limited-lifetime writable view of the buffer, starting at `start_offs`
    pub fn slice(&mut self, start_offs: usize) -> SliceBuf {
        assert!(start_offs <= self.len);
        SliceBuf {
            inner: self,
            start_offset: start_offs,
        }
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.recycle(buf);
        }
    }
}

impl AsRef<[u8]> for PooledBuffer {
    fn as_ref(&self) -> &[u8] {
        &self.raw()[..self.len]
    }
}

impl AsMut<[u8]> for PooledBuffer {
    fn as_mut(&mut self) -> &mut [u8] {
        let len = self.len;
        &mut self.raw_mut()[..len]
    }
}

impl Debug for PooledBuffer {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("len", &self.len)
            .field("capacity", &self.capacity())
            .finish()
    }
}

unsafe impl bytes::BufMut for PooledBuffer {
    fn remaining_mut(&self) -> usize {
        // grows on demand, like BytesMut
        isize::MAX as usize - self.len
    }

    unsafe fn advance_mut(&mut self, cnt: usize) {
        assert!(self.len + cnt <= self.capacity());
        self.len += cnt;
    }

    fn chunk_mut(&mut self) -> &mut UninitSlice {
        if self.len == self.capacity() {
            self.ensure_capacity(self.len + 1);
        }
        let len = self.len;
        UninitSlice::new(&mut self.raw_mut()[len..])
    }
}


/// A frozen buffer with shared ownership. The memory returns to the pool when the last clone is
///  dropped.
#[derive(Clone)]
pub struct SharedBuffer(Arc<PooledBuffer>);

impl SharedBuffer {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn span(&self, offset: usize, len: usize) -> BufferSpan {
        assert!(offset + len <= self.len(), "span {}+{} exceeds buffer length {}", offset, len, self.len());
        BufferSpan {
            buf: self.clone(),
            offset,
            len,
        }
    }

    pub fn full_span(&self) -> BufferSpan {
        self.span(0, self.len())
    }

    /// number of handles sharing this buffer
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }
}

impl AsRef<[u8]> for SharedBuffer {
    fn as_ref(&self) -> &[u8] {
        self.0.as_ref().as_ref()
    }
}

impl Debug for SharedBuffer {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("SharedBuffer").field(&self.len()).finish()
    }
}


/// A view of a contiguous part of a shared buffer
#[derive(Clone)]
pub struct BufferSpan {
    buf: SharedBuffer,
    offset: usize,
    len: usize,
}

impl BufferSpan {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// drop the first `n` bytes from the view
    pub fn advance(&mut self, n: usize) {
        assert!(n <= self.len);
        self.offset += n;
        self.len -= n;
    }

    /// splits off and returns the first `n` bytes, leaving the rest in `self`
    pub fn split_to(&mut self, n: usize) -> BufferSpan {
        assert!(n <= self.len);
        let head = BufferSpan {
            buf: self.buf.clone(),
            offset: self.offset,
            len: n,
        };
        self.advance(n);
        head
    }

    pub fn buffer(&self) -> &SharedBuffer {
        &self.buf
    }
}

impl AsRef<[u8]> for BufferSpan {
    fn as_ref(&self) -> &[u8] {
        &self.buf.as_ref()[self.offset..self.offset + self.len]
    }
}

impl Debug for BufferSpan {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        self.as_ref().fmt(f)
    }
}

impl PartialEq for BufferSpan {
    fn eq(&self, other: &Self) -> bool {
        self.as_ref() == other.as_ref()
    }
}


/// A writable view of a `PooledBuffer` from a start offset to the end. Writes and truncation
///  affect the underlying buffer, but the part before the start offset is never visible.
pub struct SliceBuf<'a> {
    inner: &'a mut PooledBuffer,
    start_offset: usize,
}

impl<'a> SliceBuf<'a> {
    pub fn len(&self) -> usize {
        self.inner.len - self.start_offset
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn truncate(&mut self, len: usize) {
        self.inner.truncate(self.start_offset + len);
    }

    pub fn clear(&mut self) {
        self.inner.len = self.start_offset;
    }
}

impl<'a> AsRef<[u8]> for SliceBuf<'a> {
    fn as_ref(&self) -> &[u8] {
        &self.inner.as_ref()[self.start_offset..]
    }
}

impl<'a> AsMut<[u8]> for SliceBuf<'a> {
    fn as_mut(&mut self) -> &mut [u8] {
        let start = self.start_offset;
        &mut self.inner.as_mut()[start..]
    }
}

impl<'a> Debug for SliceBuf<'a> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        self.as_ref().fmt(f)
    }
}

unsafe impl<'a> bytes::BufMut for SliceBuf<'a> {
    fn remaining_mut(&self) -> usize {
        self.inner.remaining_mut()
    }

    unsafe fn advance_mut(&mut self, cnt: usize) {
        self.inner.advance_mut(cnt);
    }

    fn chunk_mut(&mut self) -> &mut UninitSlice {
        self.inner.chunk_mut()
    }
}
