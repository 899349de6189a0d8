use std::fmt::Debug;
use bytes::{BufMut, Bytes};
use crate::buffers::pooled_buffer::PooledBuffer;

/// Converts between application messages and envelope payloads. One codec instance is shared by
///  all channels created with it, possibly across threads.
pub trait MessageCodec: Send + Sync + 'static {
    type Message: Debug + Send + Sync + 'static;

    /// The envelope type for a message. Must not be 0.
    fn message_type(&self, msg: &Self::Message) -> u32;

    /// Appends the payload representation of `msg` to `buf`
    fn write(&self, msg: &Self::Message, buf: &mut PooledBuffer) -> anyhow::Result<()>;

    /// Decodes a payload that was received with the given envelope type
    fn read(&self, msg_type: u32, payload: &[u8]) -> anyhow::Result<Self::Message>;
}

/// A message that is just a type tag plus opaque bytes
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawMessage {
    pub msg_type: u32,
    pub payload: Bytes,
}

impl RawMessage {
    pub fn new(msg_type: u32, payload: impl Into<Bytes>) -> RawMessage {
        RawMessage {
            msg_type,
            payload: payload.into(),
        }
    }
}

/// Passes payloads through unchanged
#[derive(Clone, Copy, Debug, Default)]
pub struct RawCodec;

impl MessageCodec for RawCodec {
    type Message = RawMessage;

    fn message_type(&self, msg: &RawMessage) -> u32 {
        msg.msg_type
    }

    fn write(&self, msg: &RawMessage, buf: &mut PooledBuffer) -> anyhow::Result<()> {
        buf.put_slice(&msg.payload);
        Ok(())
    }

    fn read(&self, msg_type: u32, payload: &[u8]) -> anyhow::Result<RawMessage> {
        Ok(RawMessage {
            msg_type,
            payload: Bytes::copy_from_slice(payload),
        })
    }
}

/// A message type that knows its own envelope type and wire representation, for use with
///  [WireCodec].
pub trait WireMessage: Debug + Send + Sync + Sized + 'static {
    fn msg_type(&self) -> u32;
    fn ser(&self, buf: &mut impl BufMut);
    fn deser(msg_type: u32, buf: &[u8]) -> anyhow::Result<Self>;
}

/// A codec for an application defined [WireMessage] type
pub struct WireCodec<M>(std::marker::PhantomData<fn() -> M>);

impl<M> WireCodec<M> {
    pub fn new() -> WireCodec<M> {
        WireCodec(Default::default())
    }
}

impl<M> Default for WireCodec<M> {
    fn default() -> Self {
        WireCodec::new()
    }
}

impl<M: WireMessage> MessageCodec for WireCodec<M> {
    type Message = M;

    fn message_type(&self, msg: &M) -> u32 {
        msg.msg_type()
    }

    fn write(&self, msg: &M, buf: &mut PooledBuffer) -> anyhow::Result<()> {
        msg.ser(buf);
        Ok(())
    }

    fn read(&self, msg_type: u32, payload: &[u8]) -> anyhow::Result<M> {
        M::deser(msg_type, payload)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use anyhow::bail;
    use bytes::Buf;
    use num_enum::{IntoPrimitive, TryFromPrimitive};
    use crate::buffers::buffer_pool::BufferPool;
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
    #[repr(u32)]
    enum PingKind {
        Ping = 1,
        Pong = 2,
    }

    #[derive(Debug, PartialEq)]
    struct PingMessage {
        kind: PingKind,
        counter: u64,
    }

    impl WireMessage for PingMessage {
        fn msg_type(&self) -> u32 {
            self.kind.into()
        }

        fn ser(&self, buf: &mut impl BufMut) {
            buf.put_u64(self.counter);
        }

        fn deser(msg_type: u32, mut buf: &[u8]) -> anyhow::Result<Self> {
            let kind = PingKind::try_from(msg_type)?;
            if buf.remaining() != 8 {
                bail!("ping payload must be 8 bytes");
            }
            Ok(PingMessage { kind, counter: buf.get_u64() })
        }
    }

    #[test]
    fn test_raw_codec() {
        let pool = Arc::new(BufferPool::new(64, 4, 1, 1));
        let mut buf = pool.get_buffer(0);
        let msg = RawMessage::new(9, &b"abc"[..]);

        RawCodec.write(&msg, &mut buf).unwrap();
        assert_eq!(RawCodec.message_type(&msg), 9);
        assert_eq!(RawCodec.read(9, buf.as_ref()).unwrap(), msg);
    }

    #[test]
    fn test_wire_codec() {
        let pool = Arc::new(BufferPool::new(64, 4, 1, 1));
        let codec = WireCodec::<PingMessage>::new();
        let msg = PingMessage { kind: PingKind::Pong, counter: 77 };

        let mut buf = pool.get_buffer(0);
        codec.write(&msg, &mut buf).unwrap();
        assert_eq!(codec.message_type(&msg), 2);
        assert_eq!(codec.read(2, buf.as_ref()).unwrap(), msg);
        assert!(codec.read(3, buf.as_ref()).is_err());
        assert!(codec.read(1, &buf.as_ref()[1..]).is_err());
    }
}
