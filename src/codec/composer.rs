use std::sync::Arc;
use anyhow::bail;
use tracing::trace;
use crate::buffers::buffer_pool::BufferPool;
use crate::buffers::pooled_buffer::{BufferSpan, PooledBuffer};
use crate::codec::envelope::{EnvelopeFlags, EnvelopeHeader};
use crate::codec::post_process::PostProcessChain;
use crate::codec::reader_writer::MessageCodec;
use crate::codec::CodecError;
use crate::util::safe_converter::PrecheckedCast;

/// Assembles envelopes.
///
/// The payload is serialized first, leaving room for the biggest possible header in front of it.
///  Once the payload (and its post-processed length) is known, the actual header is written
///  right-aligned into that room, so header and payload end up contiguous without copying the
///  payload. The resulting span starts at the first header byte.
#[derive(Clone, Debug)]
pub struct DataComposer {
    pool: Arc<BufferPool>,
    post_process: PostProcessChain,
    max_message_size: usize,
}

impl DataComposer {
    pub fn new(pool: Arc<BufferPool>, post_process: PostProcessChain, max_message_size: usize) -> DataComposer {
        DataComposer {
            pool,
            post_process,
            max_message_size,
        }
    }

    pub fn prepare_block(
        &self,
        msg_type: u32,
        flags: EnvelopeFlags,
        seq: u32,
        sseq: u32,
        write_payload: impl FnOnce(&mut PooledBuffer) -> anyhow::Result<()>,
    ) -> anyhow::Result<BufferSpan> {
        if msg_type == 0 {
            bail!("message type 0 is reserved");
        }

        const RESERVED: usize = EnvelopeHeader::MAX_SERIALIZED_LEN;

        let mut buf = self.pool.get_buffer(self.pool.mtu());
        buf.resize(RESERVED);
        write_payload(&mut buf)?;

        let mut flags = flags;
        self.post_process.on_send(&mut flags, &mut buf.slice(RESERVED))?;

        let payload_len = buf.len() - RESERVED;
        if payload_len > self.max_message_size {
            return Err(CodecError::Oversized { len: payload_len, max: self.max_message_size }.into());
        }

        let header = EnvelopeHeader {
            msg_type,
            flags,
            seq,
            sseq,
            len: payload_len.prechecked_cast(),
        };
        let start = RESERVED - header.serialized_len();
        {
            let mut header_buf: &mut [u8] = &mut buf.as_mut()[start..RESERVED];
            header.ser(&mut header_buf);
        }
        trace!(msg_type, seq, sseq, payload_len, "composed envelope");

        let total = buf.len() - start;
        Ok(buf.freeze().span(start, total))
    }

    /// Serializes an application message into an envelope
    pub fn compose<C: MessageCodec>(&self, codec: &C, msg: &C::Message, seq: u32, sseq: u32) -> anyhow::Result<BufferSpan> {
        self.prepare_block(codec.message_type(msg), EnvelopeFlags::empty(), seq, sseq, |buf| codec.write(msg, buf))
    }

    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }
}
