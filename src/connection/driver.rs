use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;
use std::pin::pin;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use anyhow::{anyhow, bail};
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::Notify;
use tracing::{debug, info, info_span, trace, warn, Instrument, Span};
use uuid::Uuid;
use crate::buffers::buffer_pool::BufferPool;
use crate::buffers::growable_queue::GrowableQueue;
use crate::buffers::pooled_buffer::PooledBuffer;
use crate::config::TransportConfig;
use crate::connection::{ConnectionHandler, ConnectionMode, ConnectionState, MessageRejected, OutboundContent, OutboundMessage, PersistentConnection};

/// Upper bound for the number of receive operations per loop iteration, so that a busy peer can
///  not starve sending and `on_update()`
const MAX_RECEIVES_PER_ITERATION: usize = 64;

/// how often a positive mode connection re-checks an ongoing connect
const CONNECT_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RecvOutcome {
    Data(usize),
    WouldBlock,
    /// the peer closed the connection
    Closed,
}

/// The transport specific part of a connection: non-blocking socket operations plus a way to
///  wait for readiness. A link is owned by the connection task and never shared.
#[async_trait]
pub(crate) trait Link: Send + 'static {
    /// the biggest chunk `try_recv()` can return
    fn max_receive_size(&self) -> usize;

    fn try_recv(&mut self, buf: &mut [u8]) -> anyhow::Result<RecvOutcome>;

    /// Sends or buffers a chunk of data. For datagram links, each call is one datagram. A
    ///  `MessageRejected` error affects only this chunk, any other error closes the connection.
    fn send(&mut self, data: &[u8]) -> anyhow::Result<()>;

    /// Pushes out buffered data as far as possible without blocking
    fn flush(&mut self) -> anyhow::Result<()>;

    /// `true` if there is buffered data waiting for the socket to become writable
    fn wants_write(&self) -> bool {
        false
    }

    /// Periodic housekeeping, returns the time until the link needs the next tick
    fn on_tick(&mut self) -> anyhow::Result<Option<Duration>> {
        Ok(None)
    }

    /// Waits until `try_recv()` or (if `want_write`) `flush()` can make progress
    async fn ready(&mut self, want_write: bool) -> anyhow::Result<()>;

    fn remote_addr(&self) -> Option<SocketAddr>;
}

pub(crate) enum LinkSlot<L> {
    Pending(BoxFuture<'static, anyhow::Result<L>>),
    Ready(L),
    Gone,
}

pub(crate) struct ConnectionShared {
    state: AtomicU8,
    closing: AtomicBool,
    torn_down: AtomicBool,
    send_queue: GrowableQueue<OutboundMessage>,
    wakeup: Notify,
    closed: Notify,
    remote: Mutex<Option<SocketAddr>>,
}

impl ConnectionShared {
    fn new(remote: Option<SocketAddr>) -> ConnectionShared {
        ConnectionShared {
            state: AtomicU8::new(ConnectionState::Created as u8),
            closing: AtomicBool::new(false),
            torn_down: AtomicBool::new(false),
            send_queue: GrowableQueue::new(64),
            wakeup: Notify::new(),
            closed: Notify::new(),
            remote: Mutex::new(remote),
        }
    }

    fn state(&self) -> ConnectionState {
        match self.state.load(Ordering::Acquire) {
            0 => ConnectionState::Created,
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Alive,
            _ => ConnectionState::Closed,
        }
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    async fn wait_closing(&self) {
        loop {
            let mut notified = pin!(self.wakeup.notified());
            notified.as_mut().enable();
            if self.is_closing() {
                return;
            }
            notified.await;
        }
    }
}

/// One iteration of a connection loop, type-erased over the link
trait CoreStep: Send {
    /// Returns the time to wait before the next step, or `None` if the connection is closed
    fn step(&mut self) -> Option<Duration>;

    fn teardown(&mut self);

    fn run(self: Box<Self>) -> BoxFuture<'static, ()>;
}

struct ConnectionCore<L: Link> {
    shared: Arc<ConnectionShared>,
    handler: Arc<dyn ConnectionHandler>,
    link: LinkSlot<L>,
    recv_buf: PooledBuffer,
    max_wait: Duration,
}

impl<L: Link> ConnectionCore<L> {
    fn on_established(&mut self, link: L) {
        let remote = link.remote_addr();
        info!(?remote, "connection established");
        *self.shared.remote.lock().unwrap() = remote;
        self.recv_buf.ensure_capacity(link.max_receive_size());
        self.link = LinkSlot::Ready(link);
        self.shared.set_state(ConnectionState::Alive);
    }

    async fn establish(&mut self) -> bool {
        if !matches!(self.link, LinkSlot::Pending(_)) {
            return true;
        }
        let LinkSlot::Pending(mut connect) = std::mem::replace(&mut self.link, LinkSlot::Gone) else {
            return false;
        };

        let shared = self.shared.clone();
        let result = tokio::select! {
            r = &mut connect => Some(r),
            _ = shared.wait_closing() => None,
        };
        match result {
            Some(Ok(link)) => {
                self.on_established(link);
                true
            }
            Some(Err(e)) => {
                warn!("connecting failed: {}", e);
                self.teardown();
                false
            }
            None => {
                debug!("disposed while connecting");
                self.teardown();
                false
            }
        }
    }

    /// Receive, send and update, without waiting. An error means the connection is dead.
    fn iterate(&mut self) -> anyhow::Result<Duration> {
        let LinkSlot::Ready(link) = &mut self.link else {
            bail!("connection has no link");
        };

        for _ in 0..MAX_RECEIVES_PER_ITERATION {
            self.recv_buf.clear();
            match link.try_recv(self.recv_buf.spare_mut())? {
                RecvOutcome::Data(n) => {
                    trace!(n, "received data");
                    self.recv_buf.commit(n);
                    self.handler.on_receive(self.recv_buf.as_ref());
                }
                RecvOutcome::WouldBlock => break,
                RecvOutcome::Closed => return Err(anyhow!("closed by peer")),
            }
        }

        while let Some(OutboundMessage { content, on_failure }) = self.shared.send_queue.pop() {
            let Err(e) = send_content(link, content) else {
                continue;
            };
            let rejected = e.downcast::<MessageRejected>()?;
            debug!("{}", rejected);
            if let Some(on_failure) = on_failure {
                on_failure(rejected);
            }
        }
        link.flush()?;

        let mut wait = self.max_wait;
        if let Some(link_wait) = link.on_tick()? {
            wait = wait.min(link_wait);
        }
        if let Some(handler_wait) = self.handler.on_update() {
            wait = wait.min(handler_wait);
        }
        Ok(wait)
    }

    async fn run_loop(mut self: Box<Self>) {
        debug!("connection task started");
        if !self.establish().await {
            return;
        }

        loop {
            let Some(wait) = self.step() else {
                debug!("connection task finished");
                return;
            };

            let shared = self.shared.clone();
            let LinkSlot::Ready(link) = &mut self.link else {
                return;
            };
            let want_write = link.wants_write();

            let failure = tokio::select! {
                r = link.ready(want_write) => r.err(),
                _ = shared.wakeup.notified() => None,
                _ = tokio::time::sleep(wait) => None,
            };
            if let Some(e) = failure {
                warn!("connection failed: {}", e);
                self.teardown();
                return;
            }
        }
    }
}

fn send_content<L: Link>(link: &mut L, content: OutboundContent) -> anyhow::Result<()> {
    let spans = match content {
        OutboundContent::Spans(spans) => spans,
        OutboundContent::Deferred(compose) => compose()
            .map_err(|e| MessageRejected(format!("serialization failed: {}", e)))?,
    };
    for span in spans {
        link.send(span.as_ref())?;
    }
    Ok(())
}

impl<L: Link> CoreStep for ConnectionCore<L> {
    fn step(&mut self) -> Option<Duration> {
        if self.shared.is_closing() {
            self.teardown();
            return None;
        }

        if let LinkSlot::Pending(connect) = &mut self.link {
            let polled = connect.as_mut().now_or_never();
            match polled {
                None => return Some(CONNECT_POLL_INTERVAL.min(self.max_wait)),
                Some(Ok(link)) => self.on_established(link),
                Some(Err(e)) => {
                    warn!("connecting failed: {}", e);
                    self.teardown();
                    return None;
                }
            }
        }

        match self.iterate() {
            Ok(_) if self.shared.is_closing() => {
                // disposed from inside a callback
                self.teardown();
                None
            }
            Ok(wait) => Some(wait),
            Err(e) => {
                debug!("closing connection: {}", e);
                self.teardown();
                None
            }
        }
    }

    fn teardown(&mut self) {
        if self.shared.torn_down.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("tearing down connection");
        self.shared.closing.store(true, Ordering::Release);

        self.handler.on_close();
        self.link = LinkSlot::Gone;
        let dropped = self.shared.send_queue.drain().len();
        if dropped > 0 {
            debug!(dropped, "discarding unsent messages");
        }

        self.shared.set_state(ConnectionState::Closed);
        self.shared.closed.notify_waiters();
    }

    fn run(self: Box<Self>) -> BoxFuture<'static, ()> {
        self.run_loop().boxed()
    }
}

/// A connection, generic over its transport only at construction time
pub struct Connection {
    id: Uuid,
    kind: &'static str,
    mode: ConnectionMode,
    established: bool,
    started: AtomicBool,
    shared: Arc<ConnectionShared>,
    core: Mutex<Option<Box<dyn CoreStep>>>,
    span: Span,
}

impl Debug for Connection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}[{}]@{:?}", self.kind, self.id, self.remote_addr())
    }
}

impl Connection {
    fn create<L: Link>(
        kind: &'static str,
        link: LinkSlot<L>,
        handler: Arc<dyn ConnectionHandler>,
        mode: ConnectionMode,
        config: &TransportConfig,
        pool: &Arc<BufferPool>,
        remote: Option<SocketAddr>,
    ) -> Arc<Connection> {
        let id = Uuid::new_v4();
        let established = matches!(link, LinkSlot::Ready(_));
        let recv_size = match &link {
            LinkSlot::Ready(l) => l.max_receive_size(),
            _ => config.mtu,
        };
        let shared = Arc::new(ConnectionShared::new(remote));

        let core = ConnectionCore {
            shared: shared.clone(),
            handler,
            link,
            recv_buf: pool.get_buffer(recv_size),
            max_wait: config.max_wait,
        };

        Arc::new(Connection {
            id,
            kind,
            mode,
            established,
            started: AtomicBool::new(false),
            shared,
            core: Mutex::new(Some(Box::new(core))),
            span: info_span!("connection", %id, kind, ?remote),
        })
    }

    /// A client connection that establishes its link when started
    pub(crate) fn connecting<L: Link>(
        kind: &'static str,
        connect: BoxFuture<'static, anyhow::Result<L>>,
        handler: Arc<dyn ConnectionHandler>,
        mode: ConnectionMode,
        config: &TransportConfig,
        pool: &Arc<BufferPool>,
        remote: Option<SocketAddr>,
    ) -> Arc<Connection> {
        Self::create(kind, LinkSlot::Pending(connect), handler, mode, config, pool, remote)
    }

    /// A connection over a link that is already established, e.g. accepted by a server
    pub(crate) fn established<L: Link>(
        kind: &'static str,
        link: L,
        handler: Arc<dyn ConnectionHandler>,
        mode: ConnectionMode,
        config: &TransportConfig,
        pool: &Arc<BufferPool>,
    ) -> Arc<Connection> {
        let remote = link.remote_addr();
        Self::create(kind, LinkSlot::Ready(link), handler, mode, config, pool, remote)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }
}

#[async_trait]
impl PersistentConnection for Connection {
    fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    fn mode(&self) -> ConnectionMode {
        self.mode
    }

    fn start_connect(&self) -> anyhow::Result<()> {
        if self.shared.is_closing() {
            bail!("connection is closed");
        }
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let _entered = self.span.enter();
        self.shared.set_state(if self.established { ConnectionState::Alive } else { ConnectionState::Connecting });

        match self.mode {
            ConnectionMode::Positive => {
                debug!("starting in positive mode");
                Ok(())
            }
            ConnectionMode::Threaded => {
                let runtime = tokio::runtime::Handle::try_current()
                    .map_err(|e| anyhow!("a connection task requires a tokio runtime: {}", e))?;
                let core = self.core.lock().unwrap().take()
                    .ok_or_else(|| anyhow!("connection task was already started"))?;
                runtime.spawn(core.run().instrument(self.span.clone()));
                Ok(())
            }
        }
    }

    fn send(&self, msg: OutboundMessage) -> anyhow::Result<()> {
        if self.shared.is_closing() {
            bail!("connection is closed");
        }
        self.shared.send_queue.push(msg);
        self.shared.wakeup.notify_one();
        Ok(())
    }

    fn step(&self) {
        if self.mode != ConnectionMode::Positive || !self.started.load(Ordering::Acquire) {
            return;
        }
        let _entered = self.span.enter();
        if let Some(core) = self.core.lock().unwrap().as_mut() {
            core.step();
        }
    }

    fn dispose(&self) {
        if !self.shared.closing.swap(true, Ordering::AcqRel) {
            let _entered = self.span.enter();
            debug!("disposing connection");
        }
        self.shared.wakeup.notify_one();

        // the core is still here if there is no connection task. If the lock is held, a step()
        //  is in progress and it will tear down when it finishes
        if let Ok(mut core) = self.core.try_lock() {
            if let Some(core) = core.as_mut() {
                let _entered = self.span.enter();
                core.teardown();
            }
        }
    }

    async fn closed(&self) {
        loop {
            let mut notified = pin!(self.shared.closed.notified());
            notified.as_mut().enable();
            if self.shared.state() == ConnectionState::Closed {
                return;
            }
            notified.await;
        }
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        *self.shared.remote.lock().unwrap()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.dispose();
    }
}
