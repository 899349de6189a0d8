use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};
use crate::buffers::buffer_pool::BufferPool;
use crate::buffers::pooled_buffer::PooledBuffer;
use crate::codec::envelope::{EnvelopeHeader, HeaderParse};
use crate::codec::post_process::PostProcessChain;
use crate::codec::CodecError;
use crate::stream::byte_stream::ByteStream;
use crate::util::safe_converter::SafeCast;

/// A decoded envelope. Frames that could not be decoded are delivered with an error instead of
///  a payload, so that the receiver can account for them (e.g. fail a pending request).
pub struct RawFrame {
    pub header: EnvelopeHeader,
    pub payload: Result<PooledBuffer, CodecError>,
}

impl RawFrame {
    pub fn is_error(&self) -> bool {
        self.payload.is_err()
    }
}

impl Debug for RawFrame {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.payload {
            Ok(p) => write!(f, "FRAME{{{:?}: {} bytes}}", self.header, p.len()),
            Err(e) => write!(f, "FRAME{{{:?}: {}}}", self.header, e),
        }
    }
}

enum SplitState {
    Header,
    Payload {
        header: EnvelopeHeader,
        buf: PooledBuffer,
    },
    Skip {
        remaining: usize,
    },
}

/// Incremental envelope parser.
///
/// The splitter never consumes part of a header: it peeks until the complete header is
///  buffered, so a header split across any number of writes is parsed exactly as if it had
///  arrived at once. Payload bytes are moved into a pooled buffer as they arrive.
///
/// Malformed headers are skipped byte by byte until a valid header is found; the first skipped
///  byte produces an error frame. Oversized payloads are skipped after producing an error frame
///  that carries their header.
pub struct DataSplitter {
    pool: Arc<BufferPool>,
    post_process: PostProcessChain,
    max_message_size: usize,
    state: SplitState,
    resyncing: bool,
}

impl DataSplitter {
    pub fn new(pool: Arc<BufferPool>, post_process: PostProcessChain, max_message_size: usize) -> DataSplitter {
        DataSplitter {
            pool,
            post_process,
            max_message_size,
            state: SplitState::Header,
            resyncing: false,
        }
    }

    /// Decodes the next frame if the stream holds enough data, returning `None` otherwise.
    ///  Calling this again after more data arrived resumes where the previous call left off.
    pub fn try_read_block(&mut self, stream: &ByteStream) -> Option<RawFrame> {
        loop {
            match &mut self.state {
                SplitState::Header => {
                    let mut header_buf = [0u8; EnvelopeHeader::MAX_SERIALIZED_LEN];
                    let n = stream.peek(&mut header_buf);
                    if n == 0 {
                        return None;
                    }

                    match EnvelopeHeader::try_deser(&header_buf[..n]) {
                        Ok(HeaderParse::Incomplete) => return None,
                        Ok(HeaderParse::Complete(header, used)) => {
                            stream.skip(used);
                            self.resyncing = false;

                            let len = header.len.safe_cast();
                            if len > self.max_message_size {
                                debug!(?header, "skipping oversized message");
                                self.state = SplitState::Skip { remaining: len };
                                return Some(RawFrame {
                                    header,
                                    payload: Err(CodecError::Oversized { len, max: self.max_message_size }),
                                });
                            }

                            self.state = SplitState::Payload {
                                header,
                                buf: self.pool.get_buffer(len),
                            };
                        }
                        Err(e) => {
                            stream.skip(1);
                            if !self.resyncing {
                                debug!("malformed envelope header: {}", e);
                                self.resyncing = true;
                                return Some(RawFrame {
                                    header: Self::unknown_header(),
                                    payload: Err(e),
                                });
                            }
                        }
                    }
                }
                SplitState::Payload { header, buf } => {
                    let len: usize = header.len.safe_cast();
                    let missing = len - buf.len();
                    if missing > 0 && stream.try_read_into(buf, missing) < missing {
                        return None;
                    }

                    let SplitState::Payload { mut header, mut buf } = std::mem::replace(&mut self.state, SplitState::Header) else {
                        unreachable!()
                    };
                    trace!(?header, "received envelope");

                    let payload = self.post_process.on_receive(&mut header.flags, &mut buf.slice(0))
                        .map(|_| buf);
                    return Some(RawFrame { header, payload });
                }
                SplitState::Skip { remaining } => {
                    let skipped = stream.skip(*remaining);
                    *remaining -= skipped;
                    if *remaining > 0 {
                        return None;
                    }
                    self.state = SplitState::Header;
                }
            }
        }
    }

    fn unknown_header() -> EnvelopeHeader {
        EnvelopeHeader {
            msg_type: 0,
            flags: Default::default(),
            seq: 0,
            sseq: 0,
            len: 0,
        }
    }

    /// Waits for and decodes the next frame, for at most `timeout`. Returns `None` on timeout or
    ///  if the stream was closed before a complete frame arrived.
    pub async fn read_block(&mut self, stream: &ByteStream, timeout: Duration) -> Option<RawFrame> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(frame) = self.try_read_block(stream) {
                return Some(frame);
            }

            let wanted = match self.state {
                SplitState::Header => stream.available() + 1,
                _ => 1,
            };
            let now = Instant::now();
            if now >= deadline || !stream.wait_available(wanted, deadline - now).await {
                return self.try_read_block(stream);
            }
        }
    }
}
