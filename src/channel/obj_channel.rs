use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;
use std::pin::pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;
use anyhow::anyhow;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, trace};
use crate::buffers::growable_queue::GrowableQueue;
use crate::channel::{FrameSink, ReceivedFrame};
use crate::codec::composer::DataComposer;
use crate::codec::post_process::PostProcessChain;
use crate::codec::reader_writer::MessageCodec;
use crate::codec::splitter::DataSplitter;
use crate::codec::CodecError;
use crate::config::ChannelOptions;
use crate::connection::attachments::Attachments;
use crate::connection::registry::{ConnectionUri, SchemeRegistry, TransportContext};
use crate::connection::{ConnectionHandler, ConnectionMode, ConnectionState, MessageRejected, OutboundMessage, PersistentConnection};
use crate::stream::byte_stream::ByteStream;

/// A message channel over one connection. Cloning is cheap, and all clones refer to the same
///  channel; the connection is disposed when the last clone is dropped.
pub struct ObjChannel<C: MessageCodec> {
    inner: Arc<ChannelInner<C>>,
}

impl<C: MessageCodec> Clone for ObjChannel<C> {
    fn clone(&self) -> Self {
        ObjChannel { inner: self.inner.clone() }
    }
}

impl<C: MessageCodec> Debug for ObjChannel<C> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "ObjChannel({:?}, {:?})", self.remote_addr(), self.state())
    }
}

struct ChannelInner<C: MessageCodec> {
    codec: Arc<C>,
    options: ChannelOptions,
    composer: DataComposer,
    splitter: Mutex<DataSplitter>,
    inbound: ByteStream,
    received: GrowableQueue<ReceivedFrame<C::Message>>,
    frames_notify: Notify,
    sink: Option<Arc<dyn FrameSink<C>>>,
    connection: OnceLock<Arc<dyn PersistentConnection>>,
    next_seq: AtomicU32,
    last_receive: Mutex<Instant>,
    attachments: Attachments,
}

impl<C: MessageCodec> ChannelInner<C> {
    fn decode_next(&self) -> Option<ReceivedFrame<C::Message>> {
        let raw = self.splitter.lock().unwrap()
            .try_read_block(&self.inbound)?;

        let header = raw.header;
        let message = raw.payload.and_then(|payload| {
            self.codec.read(header.msg_type, payload.as_ref())
                .map_err(|e| CodecError::Malformed(e.to_string()))
        });
        if let Err(e) = &message {
            debug!(msg_type = header.msg_type, seq = header.seq, "received an unusable frame: {}", e);
        }

        Some(ReceivedFrame {
            msg_type: header.msg_type,
            flags: header.flags,
            seq: header.seq,
            sseq: header.sseq,
            message,
        })
    }

    fn on_send_failed(&self, seq: u32, rejected: &MessageRejected) {
        if let Some(sink) = &self.sink {
            sink.on_send_failed(seq, rejected);
        }
    }

    fn on_closed(&self) {
        debug!("channel closed");
        self.inbound.close();
        self.attachments.clear();
        self.frames_notify.notify_waiters();
    }
}

/// A channel that is not bound to its connection yet. The connection must be created with
///  `handler`.
pub(crate) struct PreparedChannel<C: MessageCodec> {
    inner: Arc<ChannelInner<C>>,
    pub(crate) handler: Arc<dyn ConnectionHandler>,
}

impl<C: MessageCodec> PreparedChannel<C> {
    pub(crate) fn mode(&self) -> ConnectionMode {
        connection_mode(&self.inner.options)
    }

    /// Starts the connection unless the channel is configured for delayed start
    pub(crate) fn wire(self, connection: Arc<dyn PersistentConnection>) -> anyhow::Result<ObjChannel<C>> {
        if self.inner.connection.set(connection).is_err() {
            return Err(anyhow!("channel is wired to a connection already"));
        }

        let channel = ObjChannel { inner: self.inner };
        if !channel.inner.options.delay_start {
            channel.start()?;
        }
        Ok(channel)
    }
}

pub(crate) fn connection_mode(options: &ChannelOptions) -> ConnectionMode {
    if options.positive {
        ConnectionMode::Positive
    }
    else {
        ConnectionMode::Threaded
    }
}

impl<C: MessageCodec> ObjChannel<C> {
    /// Connects to `uri`, configuring the channel from the URI's query options
    pub fn connect(registry: &SchemeRegistry, uri: &ConnectionUri, codec: Arc<C>) -> anyhow::Result<ObjChannel<C>> {
        Self::connect_with(registry, uri, codec, PostProcessChain::default(), None)
    }

    pub fn connect_with(
        registry: &SchemeRegistry,
        uri: &ConnectionUri,
        codec: Arc<C>,
        post_process: PostProcessChain,
        sink: Option<Arc<dyn FrameSink<C>>>,
    ) -> anyhow::Result<ObjChannel<C>> {
        let options = uri.channel_options()?;
        let prepared = Self::prepare(registry.context(), codec, post_process, options, sink);
        let connection = registry.connect(uri, prepared.handler.clone(), prepared.mode())?;
        debug!(%uri, "connecting channel");
        prepared.wire(connection)
    }

    pub(crate) fn prepare(
        context: &TransportContext,
        codec: Arc<C>,
        post_process: PostProcessChain,
        options: ChannelOptions,
        sink: Option<Arc<dyn FrameSink<C>>>,
    ) -> PreparedChannel<C> {
        let max_message_size = context.config.max_message_size;
        let inner = Arc::new(ChannelInner {
            codec,
            options,
            composer: DataComposer::new(context.pool.clone(), post_process.clone(), max_message_size),
            splitter: Mutex::new(DataSplitter::new(context.pool.clone(), post_process, max_message_size)),
            inbound: ByteStream::new(context.pool.clone()),
            received: GrowableQueue::new(64),
            frames_notify: Notify::new(),
            sink: sink.clone(),
            connection: OnceLock::new(),
            next_seq: AtomicU32::new(1),
            last_receive: Mutex::new(Instant::now()),
            attachments: Default::default(),
        });

        let handler = Arc::new(ChannelHandler {
            inner: Arc::downgrade(&inner),
            sink,
        });
        PreparedChannel { inner, handler }
    }

    fn connection(&self) -> anyhow::Result<&Arc<dyn PersistentConnection>> {
        self.inner.connection.get()
            .ok_or_else(|| anyhow!("channel is not wired to a connection"))
    }

    pub fn options(&self) -> &ChannelOptions {
        &self.inner.options
    }

    pub fn codec(&self) -> &Arc<C> {
        &self.inner.codec
    }

    /// Starts connecting. This is only needed with `delay_start`, and it is idempotent.
    pub fn start(&self) -> anyhow::Result<()> {
        let connection = self.connection()?;
        if connection.state() == ConnectionState::Created {
            *self.inner.last_receive.lock().unwrap() = Instant::now();
        }
        connection.start_connect()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.connection.get()
            .map(|c| c.state())
            .unwrap_or(ConnectionState::Created)
    }

    pub fn is_alive(&self) -> bool {
        self.state() == ConnectionState::Alive
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.inner.connection.get()?.remote_addr()
    }

    /// Application state bound to this channel. It is cleared when the channel closes.
    pub fn attachments(&self) -> &Attachments {
        &self.inner.attachments
    }

    /// Sends a message, returning the sequence number assigned to it
    pub fn write(&self, msg: C::Message) -> anyhow::Result<u32> {
        self.send_message(msg, 0, |_| {})
    }

    /// Sends a message as the response to the peer's message with sequence number `sseq`
    pub fn write_response(&self, msg: C::Message, sseq: u32) -> anyhow::Result<u32> {
        self.send_message(msg, sseq, |_| {})
    }

    /// `on_seq` is called with the message's sequence number before the message can reach the
    ///  peer. If the connection task rejects the message later, the sink's `on_send_failed()` is
    ///  called with that sequence number.
    pub(crate) fn send_message(&self, msg: C::Message, sseq: u32, on_seq: impl FnOnce(u32)) -> anyhow::Result<u32> {
        let connection = self.connection()?;
        if self.inner.options.delay_start {
            self.start()?;
        }

        let seq = self.next_seq();
        on_seq(seq);

        let outbound = if self.inner.options.serialize_in_connection_thread {
            let composer = self.inner.composer.clone();
            let codec = self.inner.codec.clone();
            OutboundMessage::deferred(move || {
                Ok(vec![composer.compose(codec.as_ref(), &msg, seq, sseq)?])
            })
        }
        else {
            OutboundMessage::from(self.inner.composer.compose(self.inner.codec.as_ref(), &msg, seq, sseq)?)
        };

        let inner = Arc::downgrade(&self.inner);
        connection.send(outbound.with_failure_hook(move |rejected| {
            if let Some(inner) = inner.upgrade() {
                inner.on_send_failed(seq, &rejected);
            }
        }))?;
        trace!(seq, sseq, "queued message");
        Ok(seq)
    }

    fn next_seq(&self) -> u32 {
        loop {
            let seq = self.inner.next_seq.fetch_add(1, Ordering::Relaxed);
            if seq != 0 {
                return seq;
            }
        }
    }

    /// Returns the next received frame if one is available. Frames go to the sink instead if the
    ///  channel has one.
    pub fn try_read(&self) -> Option<ReceivedFrame<C::Message>> {
        if let Some(frame) = self.inner.received.pop() {
            return Some(frame);
        }
        if self.inner.sink.is_none() && !self.inner.options.deserialize_in_connection_thread {
            return self.inner.decode_next();
        }
        None
    }

    /// Waits for the next received frame for at most `timeout`. Returns `None` on timeout, or
    ///  when the channel is closed and all frames were read.
    pub async fn read(&self, timeout: Duration) -> Option<ReceivedFrame<C::Message>> {
        let deadline = Instant::now() + timeout;
        loop {
            let mut notified = pin!(self.inner.frames_notify.notified());
            notified.as_mut().enable();

            if let Some(frame) = self.try_read() {
                return Some(frame);
            }
            if self.inner.inbound.is_closed() {
                return None;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return None;
            }
        }
    }

    /// Decodes buffered frames in the calling task and passes them to the sink (or queues them for
    ///  `try_read()`), then ticks the sink. This does nothing if frames are decoded on the
    ///  connection task. Returns the number of frames decoded.
    pub fn pump(&self) -> usize {
        if self.inner.options.deserialize_in_connection_thread {
            return 0;
        }
        let num_frames = self.dispatch_available();
        if let Some(sink) = &self.inner.sink {
            sink.on_tick(self);
        }
        num_frames
    }

    fn dispatch_available(&self) -> usize {
        let mut num_frames = 0;
        while let Some(frame) = self.inner.decode_next() {
            match &self.inner.sink {
                Some(sink) => sink.on_frame(self, frame),
                None => self.inner.received.push(frame),
            }
            num_frames += 1;
        }
        num_frames
    }

    /// Runs one iteration of the connection loop in positive mode
    pub fn step(&self) {
        if let Some(connection) = self.inner.connection.get() {
            connection.step();
        }
    }

    pub fn dispose(&self) {
        match self.inner.connection.get() {
            Some(connection) => connection.dispose(),
            None => self.inner.on_closed(),
        }
    }

    /// Completes when the channel's connection is closed
    pub async fn closed(&self) {
        if let Some(connection) = self.inner.connection.get() {
            connection.closed().await;
        }
    }

    pub(crate) fn frames_notify(&self) -> &Notify {
        &self.inner.frames_notify
    }
}

/// The connection's view of a channel. It holds the channel weakly so that dropping the last
///  `ObjChannel` disposes the connection.
struct ChannelHandler<C: MessageCodec> {
    inner: Weak<ChannelInner<C>>,
    sink: Option<Arc<dyn FrameSink<C>>>,
}

impl<C: MessageCodec> ConnectionHandler for ChannelHandler<C> {
    fn on_receive(&self, data: &[u8]) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };

        *inner.last_receive.lock().unwrap() = Instant::now();
        if let Err(e) = inner.inbound.write(data) {
            debug!("dropping {} received bytes: {}", data.len(), e);
            return;
        }

        let channel = ObjChannel { inner };
        if channel.inner.options.deserialize_in_connection_thread {
            channel.dispatch_available();
        }
        channel.inner.frames_notify.notify_waiters();
    }

    fn on_update(&self) -> Option<Duration> {
        let channel = ObjChannel { inner: self.inner.upgrade()? };
        let options = &channel.inner.options;

        let mut wait = None;
        if let Some(idle_timeout) = options.idle_timeout {
            let idle = channel.inner.last_receive.lock().unwrap().elapsed();
            if idle >= idle_timeout {
                info!(?idle_timeout, "nothing received within the idle timeout, closing channel");
                channel.dispose();
                return None;
            }
            wait = Some(idle_timeout - idle);
        }

        if options.deserialize_in_connection_thread {
            if let Some(sink) = &self.sink {
                wait = min_wait(wait, sink.on_tick(&channel));
            }
        }
        wait
    }

    fn on_close(&self) {
        if let Some(sink) = &self.sink {
            sink.on_close();
        }
        if let Some(inner) = self.inner.upgrade() {
            inner.on_closed();
        }
    }
}

fn min_wait(a: Option<Duration>, b: Option<Duration>) -> Option<Duration> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, None) => a,
        (None, b) => b,
    }
}
