//! Typed message channels on top of a persistent connection.
//!
//! An `ObjChannel` owns a connection, the inbound `ByteStream` it feeds, and the composer /
//!  splitter pair that frames messages. Received frames go to a `FrameSink` if the channel has
//!  one, or are queued for `try_read()` / `read()` otherwise.
//!
//! With `deserialize_in_connection_thread` (the default), frames are decoded and dispatched by the
//!  connection task as soon as their bytes arrive. Without it, the connection task only appends
//!  bytes to the stream, and decoding happens in whichever task calls `pump()`, `try_read()` or
//!  `read()`.

use std::time::Duration;
#[cfg(test)] use mockall::automock;
use crate::codec::envelope::EnvelopeFlags;
use crate::codec::reader_writer::MessageCodec;
use crate::codec::CodecError;
use crate::connection::MessageRejected;

pub mod obj_channel;
pub mod obj_server;

pub use obj_channel::ObjChannel;
pub use obj_server::ObjServer;

/// A decoded frame. `message` is an error if the frame's payload was skipped (oversized,
///  failed post-processing) or could not be decoded; the envelope header is intact either way.
#[derive(Debug)]
pub struct ReceivedFrame<M> {
    pub msg_type: u32,
    pub flags: EnvelopeFlags,
    pub seq: u32,
    pub sseq: u32,
    pub message: Result<M, CodecError>,
}

impl<M> ReceivedFrame<M> {
    pub fn is_response(&self) -> bool {
        self.sseq != 0
    }
}

/// Consumer of a channel's frames, fixed when the channel is created.
///
/// The callbacks run on the connection task if the channel deserializes there, and in the task
///  calling `ObjChannel::pump()` otherwise.
#[cfg_attr(test, automock)]
pub trait FrameSink<C: MessageCodec>: Send + Sync + 'static {
    fn on_frame(&self, channel: &ObjChannel<C>, frame: ReceivedFrame<C::Message>);

    /// Called periodically. Returns the longest time until the next call may be needed.
    fn on_tick(&self, channel: &ObjChannel<C>) -> Option<Duration>;

    /// Called on the connection task when the message with sequence number `seq` could not be
    ///  sent. The channel stays open.
    fn on_send_failed(&self, seq: u32, rejected: &MessageRejected);

    /// Called once when the channel's connection closes
    fn on_close(&self);
}
