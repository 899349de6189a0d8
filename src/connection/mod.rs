//! Persistent connections over TCP, UDP and KCP behind a uniform contract.
//!
//! A connection is owned by exactly one *connection task*. That task is the only code touching the
//!  connection's socket(s); it feeds received bytes to the `ConnectionHandler`, polls the
//!  handler's `on_update()` once per iteration, and drains the send queue that other tasks and
//!  threads fill through `PersistentConnection::send()`.
//!
//! In positive mode there is no connection task. The host calls `step()` once per tick instead,
//!  and each call performs one iteration of the same loop on the caller's thread.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use crate::buffers::pooled_buffer::BufferSpan;

pub mod attachments;
pub mod driver;
pub mod kcp;
pub mod registry;
pub mod table;
pub mod tcp;
pub mod udp;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Created = 0,
    Connecting = 1,
    Alive = 2,
    Closed = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionMode {
    /// a dedicated connection task
    Threaded,
    /// the host drives the connection by calling `step()`
    Positive,
}

/// A single message could not be sent (failed serialization, too big for a datagram, ...). The
///  connection is not affected.
#[derive(Debug, Clone, thiserror::Error)]
#[error("message was not sent: {0}")]
pub struct MessageRejected(pub String);

/// Called on the connection task when a queued message is rejected
pub type SendFailureHook = Box<dyn FnOnce(MessageRejected) + Send>;

pub enum OutboundContent {
    /// composed bytes, sent in order
    Spans(Vec<BufferSpan>),
    /// composed by the connection task right before sending
    Deferred(Box<dyn FnOnce() -> anyhow::Result<Vec<BufferSpan>> + Send>),
}

/// A message waiting in a connection's send queue
pub struct OutboundMessage {
    pub content: OutboundContent,
    pub on_failure: Option<SendFailureHook>,
}

impl OutboundMessage {
    pub fn spans(spans: Vec<BufferSpan>) -> OutboundMessage {
        OutboundMessage {
            content: OutboundContent::Spans(spans),
            on_failure: None,
        }
    }

    pub fn deferred(compose: impl FnOnce() -> anyhow::Result<Vec<BufferSpan>> + Send + 'static) -> OutboundMessage {
        OutboundMessage {
            content: OutboundContent::Deferred(Box::new(compose)),
            on_failure: None,
        }
    }

    pub fn with_failure_hook(mut self, hook: impl FnOnce(MessageRejected) + Send + 'static) -> OutboundMessage {
        self.on_failure = Some(Box::new(hook));
        self
    }
}

impl From<BufferSpan> for OutboundMessage {
    fn from(value: BufferSpan) -> Self {
        OutboundMessage::spans(vec![value])
    }
}

/// Callbacks of a connection, fixed when the connection is created. All of them are called on
///  the connection task (or in `step()` for positive mode), never concurrently.
#[cfg_attr(test, automock)]
pub trait ConnectionHandler: Send + Sync + 'static {
    fn on_receive(&self, data: &[u8]);

    /// Called once per iteration. Returns the longest time the connection may wait before the
    ///  next iteration, `None` for 'no particular deadline'.
    fn on_update(&self) -> Option<Duration>;

    /// Called exactly once when the connection closes, before its socket is released
    fn on_close(&self);
}

#[async_trait]
pub trait PersistentConnection: Send + Sync + 'static {
    fn state(&self) -> ConnectionState;

    fn is_alive(&self) -> bool {
        self.state() == ConnectionState::Alive
    }

    fn mode(&self) -> ConnectionMode;

    /// Starts connecting: spawns the connection task, or prepares `step()` in positive mode.
    ///  Calling this more than once has no effect.
    fn start_connect(&self) -> anyhow::Result<()>;

    /// Queues a message for sending. Fails only if the connection is closed. A message that is
    ///  rejected later, on the connection task, is reported to its failure hook.
    fn send(&self, msg: OutboundMessage) -> anyhow::Result<()>;

    /// One iteration of the connection loop in positive mode, a no-op otherwise
    fn step(&self);

    /// Closes the connection. This is idempotent and may be called from any thread. A
    ///  connection task notices within `TransportConfig::max_wait`, an unstarted or positive
    ///  connection is torn down before this returns.
    fn dispose(&self);

    /// Completes when the connection is closed
    async fn closed(&self);

    fn remote_addr(&self) -> Option<SocketAddr>;
}

/// The server side of a transport, producing one connection per peer
#[async_trait]
pub trait ConnectionListener: Send + Sync + 'static {
    /// Waits for the next peer. The returned connection is established but not started, so the
    ///  caller can finish wiring it before any callback fires.
    async fn accept(&self, handler: Arc<dyn ConnectionHandler>, mode: ConnectionMode) -> anyhow::Result<Arc<dyn PersistentConnection>>;

    fn local_addrs(&self) -> Vec<SocketAddr>;

    /// Stops accepting. Connections that were accepted before stay open.
    fn close(&self);
}
