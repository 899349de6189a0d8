use bitflags::bitflags;
use bytes::BufMut;
use bytes_varint::VarIntSupportMut;
use crate::codec::CodecError;
use crate::util::varint::{u32_varint_len, VarIntRead, VarIntReadExt};

bitflags! {
    /// Envelope flags. Bits are owned by post-processors; the named ones are those of the
    ///  post-processors that ship with this crate, all other bits are passed through unchanged.
    #[derive(Debug, Default, PartialEq, Eq, Copy, Clone, Hash)]
    pub struct EnvelopeFlags: u32 {
        const CHECKSUM   = 0b0000_0001;
        const ENCRYPTED  = 0b0000_0010;
        const COMPRESSED = 0b0000_0100;

        const _ = !0;
    }
}

/// The header in front of every message on the wire. All fields are unsigned LEB128 varints:
///
/// ```ascii
/// type     message kind, 0 is reserved for 'no message'
/// flags    post-processor flags
/// seq      sender assigned sequence number, 0 for 'not a request'
/// sseq     sequence number of the request this message responds to, 0 for 'not a response'
/// len      number of payload bytes following the header
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EnvelopeHeader {
    pub msg_type: u32,
    pub flags: EnvelopeFlags,
    pub seq: u32,
    pub sseq: u32,
    pub len: u32,
}

/// Result of trying to parse a header from the start of a buffer
#[derive(Debug, PartialEq, Eq)]
pub enum HeaderParse {
    /// the header and the number of bytes it occupies
    Complete(EnvelopeHeader, usize),
    /// the buffer ends before the header does
    Incomplete,
}

impl EnvelopeHeader {
    pub const MAX_SERIALIZED_LEN: usize = 5 * 5;

    pub fn serialized_len(&self) -> usize {
        u32_varint_len(self.msg_type)
            + u32_varint_len(self.flags.bits())
            + u32_varint_len(self.seq)
            + u32_varint_len(self.sseq)
            + u32_varint_len(self.len)
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u32_varint(self.msg_type);
        buf.put_u32_varint(self.flags.bits());
        buf.put_u32_varint(self.seq);
        buf.put_u32_varint(self.sseq);
        buf.put_u32_varint(self.len);
    }

    /// Parses a header from the start of `buf` without any side effects, so a caller can retry
    ///  with more data after `Incomplete`.
    pub fn try_deser(buf: &[u8]) -> Result<HeaderParse, CodecError> {
        let mut b = buf;

        let mut fields = [0u32; 5];
        for field in fields.iter_mut() {
            match b.read_u32_varint() {
                VarIntRead::Value(v) => *field = v,
                VarIntRead::Incomplete => return Ok(HeaderParse::Incomplete),
                VarIntRead::Overflow => return Err(CodecError::Malformed("header field exceeds 32 bits".to_string())),
            }
        }

        let [msg_type, flags, seq, sseq, len] = fields;
        if msg_type == 0 {
            return Err(CodecError::Malformed("message type 0 is reserved".to_string()));
        }

        let header = EnvelopeHeader {
            msg_type,
            flags: EnvelopeFlags::from_bits_retain(flags),
            seq,
            sseq,
            len,
        };
        Ok(HeaderParse::Complete(header, buf.len() - b.len()))
    }
}
