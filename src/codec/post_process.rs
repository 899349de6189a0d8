use std::fmt::Debug;
use std::sync::Arc;
use bytes::BufMut;
use crc::{Crc, CRC_32_ISO_HDLC};
use tracing::trace;
use crate::buffers::pooled_buffer::SliceBuf;
use crate::codec::envelope::EnvelopeFlags;
use crate::codec::CodecError;

/// A stage that transforms a message's payload in place after serialization (and reverses the
///  transformation before deserialization), e.g. for checksums or encryption. A stage may
///  change the payload's length and set or clear envelope flags to tell its counterpart on the
///  receiving side what to do.
pub trait PostProcess: Debug + Send + Sync + 'static {
    /// Stages run in ascending priority on send and in descending priority on receive
    fn priority(&self) -> i32;

    fn name(&self) -> &str;

    fn on_send(&self, flags: &mut EnvelopeFlags, payload: &mut SliceBuf) -> Result<(), CodecError>;

    fn on_receive(&self, flags: &mut EnvelopeFlags, payload: &mut SliceBuf) -> Result<(), CodecError>;
}

/// An ordered list of post-processing stages. Cloning is cheap.
#[derive(Clone, Debug, Default)]
pub struct PostProcessChain {
    stages: Arc<Vec<Arc<dyn PostProcess>>>,
}

impl PostProcessChain {
    pub fn new(mut stages: Vec<Arc<dyn PostProcess>>) -> PostProcessChain {
        stages.sort_by_key(|s| s.priority());
        PostProcessChain {
            stages: Arc::new(stages),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// the chain with an additional stage
    pub fn with(&self, stage: Arc<dyn PostProcess>) -> PostProcessChain {
        let mut stages = self.stages.as_ref().clone();
        stages.push(stage);
        PostProcessChain::new(stages)
    }

    pub fn on_send(&self, flags: &mut EnvelopeFlags, payload: &mut SliceBuf) -> Result<(), CodecError> {
        for stage in self.stages.iter() {
            trace!(stage = stage.name(), "post-processing outgoing payload");
            stage.on_send(flags, payload)?;
        }
        Ok(())
    }

    pub fn on_receive(&self, flags: &mut EnvelopeFlags, payload: &mut SliceBuf) -> Result<(), CodecError> {
        for stage in self.stages.iter().rev() {
            trace!(stage = stage.name(), "post-processing incoming payload");
            stage.on_receive(flags, payload)?;
        }
        Ok(())
    }
}

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Appends a CRC-32 of the payload (big endian) and sets the CHECKSUM flag. Incoming payloads
///  without the flag pass through unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct Crc32PostProcess;

impl Crc32PostProcess {
    /// Checksums are computed over plain text, before any stage with a higher priority changes
    ///  the payload.
    pub const PRIORITY: i32 = -100;
}

impl PostProcess for Crc32PostProcess {
    fn priority(&self) -> i32 {
        Self::PRIORITY
    }

    fn name(&self) -> &str {
        "crc32"
    }

    fn on_send(&self, flags: &mut EnvelopeFlags, payload: &mut SliceBuf) -> Result<(), CodecError> {
        let checksum = CRC32.checksum(payload.as_ref());
        payload.put_u32(checksum);
        flags.insert(EnvelopeFlags::CHECKSUM);
        Ok(())
    }

    fn on_receive(&self, flags: &mut EnvelopeFlags, payload: &mut SliceBuf) -> Result<(), CodecError> {
        if !flags.contains(EnvelopeFlags::CHECKSUM) {
            return Ok(());
        }

        let len = payload.len();
        if len < size_of::<u32>() {
            return Err(CodecError::PostProcess("payload is too short for a checksum".to_string()));
        }
        let data_len = len - size_of::<u32>();

        let mut expected = [0u8; 4];
        expected.copy_from_slice(&payload.as_ref()[data_len..]);
        let expected = u32::from_be_bytes(expected);
        let actual = CRC32.checksum(&payload.as_ref()[..data_len]);
        if actual != expected {
            return Err(CodecError::PostProcess(format!("checksum mismatch: expected {:08x}, was {:08x}", expected, actual)));
        }

        payload.truncate(data_len);
        flags.remove(EnvelopeFlags::CHECKSUM);
        Ok(())
    }
}
