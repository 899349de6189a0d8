//! Framing of messages into envelopes on top of a byte stream.
//!
//! `DataComposer` turns a message into a buffer holding envelope header and payload,
//!  `DataSplitter` incrementally parses envelopes from a `ByteStream`. Both run the payload
//!  through a `PostProcessChain`, and a `MessageCodec` converts between payload bytes and
//!  application messages.

pub mod composer;
pub mod envelope;
pub mod post_process;
pub mod reader_writer;
pub mod splitter;

/// Protocol errors in a single frame. None of these are fatal for the connection: the frame is
///  skipped and reported as an error frame.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("message of {len} bytes exceeds the maximum of {max} bytes")]
    Oversized { len: usize, max: usize },
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("post-processing failed: {0}")]
    PostProcess(String),
}
