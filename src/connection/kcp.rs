//! KCP: reliable, ordered delivery over UDP by positive acks, a sliding window and fast
//!  retransmit, all driven by the connection task's ticks.
//!
//! Application data is cut into chunks of at most one segment before it is handed to the ARQ
//!  layer, so no KCP message is ever fragmented. Each chunk arrives as one `on_receive()` call;
//!  the channel's byte stream puts envelopes back together.
//!
//! Conversation ids identify a connection. `kcpraw://host:port/<conv>` uses a fixed id on both
//!  sides. `kcp://host:port` lets the server assign one: the client opens conversation 0, sends
//!  `[0x01][nonce: u64 BE]`, the server answers `[0x02][nonce: u64 BE][conv: u32 BE]` on the same
//!  conversation, and both sides switch to the assigned id. The client holds back application
//!  data until this handshake is complete.

use std::collections::hash_map::Entry;
use std::collections::VecDeque;
use std::fmt::Debug;
use std::io::Write;
use std::net::SocketAddr;
use std::pin::pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use anyhow::{anyhow, bail};
use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::FutureExt;
use kcp::Kcp;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use rustc_hash::FxHashMap;
use tokio::net::UdpSocket;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};
use crate::buffers::growable_queue::GrowableQueue;
use crate::buffers::ring_queue::ConcurrentRingQueue;
use crate::config::KcpTuning;
use crate::connection::driver::{Connection, Link, RecvOutcome};
use crate::connection::registry::{ConnectionUri, TransportContext, TransportFactory};
use crate::connection::table::{ConnectionId, ConnectionTable};
use crate::connection::udp::{bind_server, is_transient, ServerLink, UdpLink, UdpServer, MAX_DATAGRAM_SIZE};
use crate::connection::{ConnectionHandler, ConnectionListener, ConnectionMode, MessageRejected, PersistentConnection};

/// the conversation id reserved for the consult handshake
pub const CONSULT_CONV: u32 = 0;

/// upper bound for datagrams fed into the ARQ layer per `try_recv()` call
const MAX_DATAGRAMS_PER_RECV: usize = 64;

/// KCP segment command for data
const KCP_CMD_PUSH: u8 = 81;

fn kcp_error(e: impl Debug) -> anyhow::Error {
    anyhow!("KCP error: {:?}", e)
}

fn now_ms(epoch: Instant) -> u32 {
    epoch.elapsed().as_millis() as u32
}

/// The conversation id of a KCP segment: the first four bytes, little endian
fn conv_of(datagram: &[u8]) -> Option<u32> {
    if datagram.len() < KcpTuning::SEGMENT_OVERHEAD {
        return None;
    }
    Some((&datagram[..4]).get_u32_le())
}

/// Collects the datagrams the ARQ layer emits, to be sent by the owner of the socket
struct KcpOutput {
    outbox: Arc<GrowableQueue<Bytes>>,
}

impl Write for KcpOutput {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.outbox.push(Bytes::copy_from_slice(buf));
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn new_kcp(conv: u32, tuning: &KcpTuning, mtu: usize, outbox: Arc<GrowableQueue<Bytes>>, now: u32) -> anyhow::Result<Kcp<KcpOutput>> {
    let mut kcp = Kcp::new(conv, KcpOutput { outbox });
    kcp.set_nodelay(tuning.nodelay, tuning.interval_ms, tuning.resend, tuning.no_congestion_control);
    kcp.set_wndsize(tuning.send_window, tuning.recv_window);
    kcp.set_mtu(mtu).map_err(kcp_error)?;
    kcp.update(now).map_err(kcp_error)?;
    Ok(kcp)
}

/// The nonce of a consult request in the first data segment (sn 0) of a datagram. This is how a
///  peer starts a handshake, so it identifies a restarted peer before the segment reaches the ARQ
///  layer, which would discard it as a duplicate.
fn starting_request(datagram: &[u8]) -> Option<u64> {
    let mut buf = datagram;
    while buf.remaining() >= KcpTuning::SEGMENT_OVERHEAD {
        let _conv = buf.get_u32_le();
        let cmd = buf.get_u8();
        let frg = buf.get_u8();
        let _wnd = buf.get_u16_le();
        let _ts = buf.get_u32_le();
        let sn = buf.get_u32_le();
        let _una = buf.get_u32_le();
        let len = buf.get_u32_le() as usize;
        if len > buf.remaining() {
            return None;
        }
        let (data, rest) = buf.split_at(len);
        if cmd == KCP_CMD_PUSH && sn == 0 && frg == 0 {
            if let Ok(ConsultMessage::Request { nonce }) = ConsultMessage::deser(data) {
                return Some(nonce);
            }
        }
        buf = rest;
    }
    None
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
enum ConsultKind {
    Request = 1,
    Assign = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConsultMessage {
    Request { nonce: u64 },
    Assign { nonce: u64, conv: u32 },
}

impl ConsultMessage {
    fn ser(&self, buf: &mut impl BufMut) {
        match *self {
            ConsultMessage::Request { nonce } => {
                buf.put_u8(ConsultKind::Request.into());
                buf.put_u64(nonce);
            }
            ConsultMessage::Assign { nonce, conv } => {
                buf.put_u8(ConsultKind::Assign.into());
                buf.put_u64(nonce);
                buf.put_u32(conv);
            }
        }
    }

    fn deser(mut buf: &[u8]) -> anyhow::Result<ConsultMessage> {
        let kind = ConsultKind::try_from(buf.try_get_u8()?)?;
        let nonce = buf.try_get_u64()?;
        let msg = match kind {
            ConsultKind::Request => ConsultMessage::Request { nonce },
            ConsultKind::Assign => ConsultMessage::Assign { nonce, conv: buf.try_get_u32()? },
        };
        if buf.has_remaining() {
            bail!("{} trailing bytes after consult message", buf.remaining());
        }
        Ok(msg)
    }
}

enum Phase {
    Consulting {
        nonce: u64,
        since: Instant,
        held: VecDeque<Bytes>,
    },
    Established,
}

/// KCP on top of a datagram link
pub(crate) struct KcpLink<L: Link> {
    inner: L,
    kcp: Kcp<KcpOutput>,
    outbox: Arc<GrowableQueue<Bytes>>,
    phase: Phase,
    datagram: Vec<u8>,
    tuning: KcpTuning,
    mtu: usize,
    epoch: Instant,
}

impl<L: Link> KcpLink<L> {
    pub(crate) fn new(inner: L, conv: u32, tuning: &KcpTuning, mtu: usize) -> anyhow::Result<KcpLink<L>> {
        let outbox = Arc::new(GrowableQueue::new(256));
        let epoch = Instant::now();
        let kcp = new_kcp(conv, tuning, mtu, outbox.clone(), now_ms(epoch))?;
        Ok(KcpLink {
            datagram: vec![0u8; inner.max_receive_size()],
            inner,
            kcp,
            outbox,
            phase: Phase::Established,
            tuning: tuning.clone(),
            mtu,
            epoch,
        })
    }

    /// Starts the consult handshake on the reserved conversation
    pub(crate) fn consult(inner: L, tuning: &KcpTuning, mtu: usize) -> anyhow::Result<KcpLink<L>> {
        let mut link = Self::new(inner, CONSULT_CONV, tuning, mtu)?;
        let nonce = rand::random::<u64>();

        let mut request = BytesMut::new();
        ConsultMessage::Request { nonce }.ser(&mut request);
        link.kcp.send(&request).map_err(kcp_error)?;

        debug!(nonce, "starting KCP consult handshake");
        link.phase = Phase::Consulting {
            nonce,
            since: Instant::now(),
            held: VecDeque::new(),
        };
        Ok(link)
    }

    fn mss(&self) -> usize {
        self.mtu - KcpTuning::SEGMENT_OVERHEAD
    }

    fn send_chunks(&mut self, data: &[u8]) -> anyhow::Result<()> {
        let mss = self.mss();
        for chunk in data.chunks(mss) {
            self.kcp.send(chunk).map_err(kcp_error)?;
        }
        Ok(())
    }

    fn drain_outbox(&mut self) -> anyhow::Result<()> {
        while let Some(datagram) = self.outbox.pop() {
            if let Err(e) = self.inner.send(&datagram) {
                // the ARQ layer retransmits lost segments
                let rejected = e.downcast::<MessageRejected>()?;
                trace!("dropping KCP segment: {}", rejected);
            }
        }
        self.inner.flush()
    }

    fn input(&mut self, len: usize) -> anyhow::Result<()> {
        let datagram = &self.datagram[..len];
        match conv_of(datagram) {
            None => {
                trace!(len, "ignoring runt datagram");
                return Ok(());
            }
            Some(conv) if conv != self.kcp.conv() => {
                trace!(conv, expected = self.kcp.conv(), "ignoring datagram of a different conversation");
                return Ok(());
            }
            Some(_) => {}
        }
        if let Err(e) = self.kcp.input(datagram) {
            debug!("dropping malformed KCP datagram: {:?}", e);
        }

        if matches!(self.phase, Phase::Consulting { .. }) {
            self.try_finish_consult()?;
        }
        Ok(())
    }

    fn try_finish_consult(&mut self) -> anyhow::Result<()> {
        let Phase::Consulting { nonce, .. } = self.phase else {
            return Ok(());
        };
        let Ok(size) = self.kcp.peeksize() else {
            return Ok(());
        };
        let mut reply = vec![0u8; size];
        let n = self.kcp.recv(&mut reply).map_err(kcp_error)?;

        match ConsultMessage::deser(&reply[..n]) {
            Ok(ConsultMessage::Assign { nonce: reply_nonce, conv }) if reply_nonce == nonce => self.switch_conversation(conv),
            Ok(other) => {
                debug!(?other, "ignoring unexpected consult message");
                Ok(())
            }
            Err(e) => {
                debug!("ignoring malformed consult message: {}", e);
                Ok(())
            }
        }
    }

    fn switch_conversation(&mut self, conv: u32) -> anyhow::Result<()> {
        if conv == CONSULT_CONV {
            bail!("server assigned the reserved conversation id");
        }

        // acknowledge the assignment before the handshake conversation goes away
        self.kcp.flush().map_err(kcp_error)?;
        self.drain_outbox()?;

        self.kcp = new_kcp(conv, &self.tuning, self.mtu, self.outbox.clone(), now_ms(self.epoch))?;
        let Phase::Consulting { held, since, .. } = std::mem::replace(&mut self.phase, Phase::Established) else {
            return Ok(());
        };
        info!(conv, elapsed = ?since.elapsed(), held = held.len(), "KCP conversation assigned");
        for data in held {
            self.send_chunks(&data)?;
        }
        Ok(())
    }
}

#[async_trait]
impl<L: Link> Link for KcpLink<L> {
    fn max_receive_size(&self) -> usize {
        MAX_DATAGRAM_SIZE
    }

    fn try_recv(&mut self, buf: &mut [u8]) -> anyhow::Result<RecvOutcome> {
        for _ in 0..MAX_DATAGRAMS_PER_RECV {
            if matches!(self.phase, Phase::Established) {
                if let Ok(size) = self.kcp.peeksize() {
                    if size > buf.len() {
                        bail!("KCP message of {} bytes exceeds the receive buffer", size);
                    }
                    let n = self.kcp.recv(buf).map_err(kcp_error)?;
                    return Ok(RecvOutcome::Data(n));
                }
            }

            match self.inner.try_recv(&mut self.datagram)? {
                RecvOutcome::Data(n) => self.input(n)?,
                other => return Ok(other),
            }
        }
        Ok(RecvOutcome::WouldBlock)
    }

    fn send(&mut self, data: &[u8]) -> anyhow::Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        match &mut self.phase {
            Phase::Consulting { held, .. } => {
                held.push_back(Bytes::copy_from_slice(data));
                Ok(())
            }
            Phase::Established => self.send_chunks(data),
        }
    }

    fn flush(&mut self) -> anyhow::Result<()> {
        self.kcp.flush().map_err(kcp_error)?;
        self.drain_outbox()
    }

    fn wants_write(&self) -> bool {
        self.inner.wants_write()
    }

    fn on_tick(&mut self) -> anyhow::Result<Option<Duration>> {
        let now = now_ms(self.epoch);
        self.kcp.update(now).map_err(kcp_error)?;
        self.drain_outbox()?;

        if let Phase::Consulting { since, .. } = &self.phase {
            if since.elapsed() > self.tuning.consult_timeout {
                bail!("KCP consult handshake timed out");
            }
        }

        let next = self.kcp.check(now);
        let until_next = Duration::from_millis(next.saturating_sub(now) as u64);
        let mut wait = until_next.min(self.tuning.update_interval);
        if let Some(inner_wait) = self.inner.on_tick()? {
            wait = wait.min(inner_wait);
        }
        Ok(Some(wait))
    }

    async fn ready(&mut self, want_write: bool) -> anyhow::Result<()> {
        self.inner.ready(want_write).await
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.inner.remote_addr()
    }
}

/// Server side state of a peer doing the consult handshake
struct ConsultSession {
    kcp: Kcp<KcpOutput>,
    outbox: Arc<GrowableQueue<Bytes>>,
    created: Instant,
    /// the nonce of the request this session answers
    nonce: Option<u64>,
    assigned: Option<ConnectionId>,
}

impl ConsultSession {
    fn new(tuning: &KcpTuning, mtu: usize, now: u32) -> anyhow::Result<ConsultSession> {
        let outbox = Arc::new(GrowableQueue::new(16));
        Ok(ConsultSession {
            kcp: new_kcp(CONSULT_CONV, tuning, mtu, outbox.clone(), now)?,
            outbox,
            created: Instant::now(),
            nonce: None,
            assigned: None,
        })
    }

    /// Feeds a datagram, returns the nonce if it completed a request
    fn input(&mut self, datagram: &[u8]) -> Option<u64> {
        if let Err(e) = self.kcp.input(datagram) {
            debug!("dropping malformed consult datagram: {:?}", e);
            return None;
        }

        let mut nonce = None;
        while let Ok(size) = self.kcp.peeksize() {
            let mut buf = vec![0u8; size];
            let Ok(n) = self.kcp.recv(&mut buf) else {
                break;
            };
            match ConsultMessage::deser(&buf[..n]) {
                Ok(ConsultMessage::Request { nonce: n }) => nonce = Some(n),
                other => debug!(?other, "ignoring unexpected consult message"),
            }
        }
        // the request is acknowledged right away rather than with the next update
        if let Err(e) = self.kcp.flush() {
            debug!("flushing consult session failed: {:?}", e);
        }
        nonce
    }

    fn assign(&mut self, nonce: u64, conv: u32) -> anyhow::Result<()> {
        let mut reply = BytesMut::new();
        ConsultMessage::Assign { nonce, conv }.ser(&mut reply);
        self.kcp.send(&reply).map_err(kcp_error)?;
        self.kcp.flush().map_err(kcp_error)
    }

    fn update(&mut self, now: u32) {
        if let Err(e) = self.kcp.update(now) {
            debug!("updating consult session failed: {:?}", e);
        }
    }
}

/// Where the server's listener task puts datagrams for an established conversation
struct Route {
    remote: Mutex<SocketAddr>,
    inbox: GrowableQueue<Bytes>,
    notify: Notify,
}

type RouteTable = Arc<Mutex<ConnectionTable<Arc<Route>>>>;

struct AcceptedConversation {
    id: ConnectionId,
    route: Arc<Route>,
}

/// The datagram link of a server side conversation. Receiving goes through the route's inbox,
///  sending through the server's shared socket.
pub(crate) struct RoutedLink {
    id: ConnectionId,
    route: Arc<Route>,
    socket: Arc<UdpSocket>,
    routes: RouteTable,
}

#[async_trait]
impl Link for RoutedLink {
    fn max_receive_size(&self) -> usize {
        MAX_DATAGRAM_SIZE
    }

    fn try_recv(&mut self, buf: &mut [u8]) -> anyhow::Result<RecvOutcome> {
        match self.route.inbox.pop() {
            Some(datagram) => {
                buf[..datagram.len()].copy_from_slice(&datagram);
                Ok(RecvOutcome::Data(datagram.len()))
            }
            None => Ok(RecvOutcome::WouldBlock),
        }
    }

    fn send(&mut self, data: &[u8]) -> anyhow::Result<()> {
        let remote = *self.route.remote.lock().unwrap();
        match self.socket.try_send_to(data, remote) {
            Ok(_) => Ok(()),
            Err(e) if is_transient(e.kind()) => {
                trace!(%remote, "dropping datagram: {}", e);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn flush(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn ready(&mut self, _want_write: bool) -> anyhow::Result<()> {
        if self.route.inbox.is_empty() {
            self.route.notify.notified().await;
        }
        Ok(())
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        Some(*self.route.remote.lock().unwrap())
    }
}

impl Drop for RoutedLink {
    fn drop(&mut self) {
        if self.routes.lock().unwrap().remove(self.id).is_some() {
            debug!(conv = self.id.to_conv(), "KCP conversation released");
        }
    }
}

enum ListenerEvent {
    Datagram(std::io::Result<(usize, SocketAddr)>),
    Tick,
}

/// The server's socket owner: runs consult handshakes and routes datagrams of established
///  conversations by their id
struct ConsultListener {
    socket: Arc<UdpSocket>,
    routes: RouteTable,
    backlog: Arc<ConcurrentRingQueue<AcceptedConversation>>,
    backlog_notify: Arc<Notify>,
    sessions: FxHashMap<SocketAddr, ConsultSession>,
    tuning: KcpTuning,
    mtu: usize,
    epoch: Instant,
}

impl ConsultListener {
    async fn run(mut self) {
        let socket = self.socket.clone();
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let mut housekeeping = tokio::time::interval(self.tuning.update_interval);
        housekeeping.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let event = tokio::select! {
                r = socket.recv_from(&mut buf) => ListenerEvent::Datagram(r),
                _ = housekeeping.tick() => ListenerEvent::Tick,
            };
            match event {
                ListenerEvent::Datagram(Ok((n, remote))) => self.on_datagram(&buf[..n], remote),
                ListenerEvent::Datagram(Err(e)) if is_transient(e.kind()) => {}
                ListenerEvent::Datagram(Err(e)) => {
                    warn!("KCP server socket failed: {}", e);
                    return;
                }
                ListenerEvent::Tick => self.update_sessions(),
            }
        }
    }

    fn on_datagram(&mut self, datagram: &[u8], remote: SocketAddr) {
        let Some(conv) = conv_of(datagram) else {
            trace!(%remote, "ignoring runt datagram");
            return;
        };
        if conv == CONSULT_CONV {
            self.on_consult(datagram, remote);
            return;
        }

        let id = ConnectionId::from_conv(conv);
        let route = self.routes.lock().unwrap().get(id).cloned();
        let Some(route) = route else {
            trace!(conv, %remote, "dropping datagram for unknown conversation");
            return;
        };
        {
            let mut route_remote = route.remote.lock().unwrap();
            if *route_remote != remote {
                debug!(conv, old = %*route_remote, new = %remote, "KCP peer changed its address");
                *route_remote = remote;
            }
        }
        route.inbox.push(Bytes::copy_from_slice(datagram));
        route.notify.notify_one();
    }

    fn on_consult(&mut self, datagram: &[u8], remote: SocketAddr) {
        if let Some(nonce) = starting_request(datagram) {
            let restarted = self.sessions.get(&remote)
                .and_then(|session| session.nonce)
                .is_some_and(|known| known != nonce);
            if restarted {
                debug!(%remote, "peer restarted the consult handshake: discarding its previous session");
                self.sessions.remove(&remote);
            }
        }

        let now = now_ms(self.epoch);
        let session = match self.sessions.entry(remote) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(e) => match ConsultSession::new(&self.tuning, self.mtu, now) {
                Ok(session) => {
                    debug!(%remote, "new consult session");
                    e.insert(session)
                }
                Err(err) => {
                    warn!("cannot create consult session: {}", err);
                    return;
                }
            },
        };

        let request = session.input(datagram);
        if request.is_some() {
            session.nonce = request;
        }
        let already_assigned = session.assigned.is_some();
        if let (Some(nonce), false) = (request, already_assigned) {
            if let Some(id) = self.register(remote) {
                if let Some(session) = self.sessions.get_mut(&remote) {
                    session.assigned = Some(id);
                    if let Err(e) = session.assign(nonce, id.to_conv()) {
                        warn!("answering consult request failed: {}", e);
                    }
                }
            }
        }

        if let Some(session) = self.sessions.get(&remote) {
            while let Some(d) = session.outbox.pop() {
                if let Err(e) = self.socket.try_send_to(&d, remote) {
                    trace!(%remote, "dropping consult datagram: {}", e);
                }
            }
        }
    }

    /// Allocates a conversation and offers it to `accept()`
    fn register(&self, remote: SocketAddr) -> Option<ConnectionId> {
        let route = Arc::new(Route {
            remote: Mutex::new(remote),
            inbox: GrowableQueue::new(64),
            notify: Notify::new(),
        });
        let Some(id) = self.routes.lock().unwrap().insert(route.clone()) else {
            warn!(%remote, "no free conversation ids - ignoring consult request");
            return None;
        };

        if let Err(rejected) = self.backlog.try_add(AcceptedConversation { id, route }) {
            warn!(%remote, "KCP backlog is full - ignoring consult request");
            self.routes.lock().unwrap().remove(rejected.id);
            return None;
        }
        debug!(%remote, conv = id.to_conv(), "assigned KCP conversation");
        self.backlog_notify.notify_waiters();
        Some(id)
    }

    fn update_sessions(&mut self) {
        let now = now_ms(self.epoch);
        let timeout = self.tuning.consult_timeout;
        let socket = &self.socket;
        self.sessions.retain(|remote, session| {
            if session.created.elapsed() > timeout {
                debug!(%remote, "dropping consult session");
                return false;
            }
            session.update(now);
            while let Some(d) = session.outbox.pop() {
                if let Err(e) = socket.try_send_to(&d, *remote) {
                    trace!(%remote, "dropping consult datagram: {}", e);
                }
            }
            true
        });
    }
}

/// A KCP server assigning conversation ids through the consult handshake. Any number of peers
///  share the server's single UDP socket.
pub struct KcpServer {
    local_addr: SocketAddr,
    socket: Arc<UdpSocket>,
    routes: RouteTable,
    backlog: Arc<ConcurrentRingQueue<AcceptedConversation>>,
    backlog_notify: Arc<Notify>,
    closed: AtomicBool,
    listener_task: Mutex<Option<JoinHandle<()>>>,
    context: TransportContext,
}

impl KcpServer {
    pub async fn bind(addr: SocketAddr, context: TransportContext) -> anyhow::Result<KcpServer> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        socket.writable().await?;
        let local_addr = socket.local_addr()?;
        let routes: RouteTable = Default::default();
        let backlog = Arc::new(ConcurrentRingQueue::new(context.config.tcp_backlog));
        let backlog_notify = Arc::new(Notify::new());

        let listener = ConsultListener {
            socket: socket.clone(),
            routes: routes.clone(),
            backlog: backlog.clone(),
            backlog_notify: backlog_notify.clone(),
            sessions: Default::default(),
            tuning: context.config.kcp.clone(),
            mtu: context.config.mtu,
            epoch: Instant::now(),
        };
        let listener_task = tokio::spawn(listener.run());
        info!(%local_addr, "KCP server listening");

        Ok(KcpServer {
            local_addr,
            socket,
            routes,
            backlog,
            backlog_notify,
            closed: AtomicBool::new(false),
            listener_task: Mutex::new(Some(listener_task)),
            context,
        })
    }

    /// number of conversations that are currently routed
    pub fn num_conversations(&self) -> usize {
        self.routes.lock().unwrap().len()
    }

    async fn next_conversation(&self) -> anyhow::Result<AcceptedConversation> {
        loop {
            let mut notified = pin!(self.backlog_notify.notified());
            notified.as_mut().enable();
            if self.closed.load(Ordering::Acquire) {
                bail!("KCP server is closed");
            }
            if let Some(accepted) = self.backlog.try_take() {
                return Ok(accepted);
            }
            notified.await;
        }
    }
}

#[async_trait]
impl ConnectionListener for KcpServer {
    async fn accept(&self, handler: Arc<dyn ConnectionHandler>, mode: ConnectionMode) -> anyhow::Result<Arc<dyn PersistentConnection>> {
        let AcceptedConversation { id, route } = self.next_conversation().await?;
        let routed = RoutedLink {
            id,
            route,
            socket: self.socket.clone(),
            routes: self.routes.clone(),
        };
        let config = &self.context.config;
        let link = KcpLink::new(routed, id.to_conv(), &config.kcp, config.mtu)?;
        info!(conv = id.to_conv(), remote = ?link.remote_addr(), "accepted KCP conversation");
        Ok(Connection::established("kcp", link, handler, mode, config, &self.context.pool))
    }

    fn local_addrs(&self) -> Vec<SocketAddr> {
        vec![self.local_addr]
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(local_addr = %self.local_addr, "closing KCP server");
        if let Some(task) = self.listener_task.lock().unwrap().take() {
            task.abort();
        }
        for unclaimed in self.backlog.drain() {
            self.routes.lock().unwrap().remove(unclaimed.id);
        }
        self.backlog_notify.notify_waiters();
    }
}

impl Drop for KcpServer {
    fn drop(&mut self) {
        self.close();
    }
}

/// A KCP server with a fixed conversation id on top of a UDP server
pub struct KcpRawServer {
    udp: UdpServer,
    conv: u32,
    context: TransportContext,
}

#[async_trait]
impl ConnectionListener for KcpRawServer {
    async fn accept(&self, handler: Arc<dyn ConnectionHandler>, mode: ConnectionMode) -> anyhow::Result<Arc<dyn PersistentConnection>> {
        let config = &self.context.config;
        let pool = &self.context.pool;
        Ok(match self.udp.accept_link().await? {
            ServerLink::Unicast(link) => Connection::established("kcpraw", KcpLink::new(link, self.conv, &config.kcp, config.mtu)?, handler, mode, config, pool),
            ServerLink::FanOut(link) => Connection::established("kcpraw", KcpLink::new(link, self.conv, &config.kcp, config.mtu)?, handler, mode, config, pool),
        })
    }

    fn local_addrs(&self) -> Vec<SocketAddr> {
        self.udp.local_addrs()
    }

    fn close(&self) {
        self.udp.close();
    }
}

fn conv_from_path(uri: &ConnectionUri) -> anyhow::Result<u32> {
    let conv = uri.path.parse::<u32>()
        .map_err(|e| anyhow!("{} does not have a conversation id as its path: {}", uri, e))?;
    if conv == CONSULT_CONV {
        bail!("conversation id {} is reserved", CONSULT_CONV);
    }
    Ok(conv)
}

/// `kcpraw://host:port/<conv>`
pub struct KcpRawTransport;

#[async_trait]
impl TransportFactory for KcpRawTransport {
    fn connect(&self, ctx: &TransportContext, uri: &ConnectionUri, handler: Arc<dyn ConnectionHandler>, mode: ConnectionMode) -> anyhow::Result<Arc<dyn PersistentConnection>> {
        let conv = conv_from_path(uri)?;
        let uri = uri.clone();
        let tuning = ctx.config.kcp.clone();
        let mtu = ctx.config.mtu;
        let connect = async move {
            let addr = uri.resolve().await?;
            let udp = UdpLink::connect(addr, false).await?;
            KcpLink::new(udp, conv, &tuning, mtu)
        }.boxed();
        Ok(Connection::connecting("kcpraw", connect, handler, mode, &ctx.config, &ctx.pool, None))
    }

    async fn bind(&self, ctx: &TransportContext, uri: &ConnectionUri) -> anyhow::Result<Arc<dyn ConnectionListener>> {
        let conv = conv_from_path(uri)?;
        Ok(Arc::new(KcpRawServer {
            udp: bind_server(uri, ctx).await?,
            conv,
            context: ctx.clone(),
        }))
    }
}

/// `kcp://host:port`, with conversation ids assigned by the server
pub struct KcpConsultTransport;

#[async_trait]
impl TransportFactory for KcpConsultTransport {
    fn connect(&self, ctx: &TransportContext, uri: &ConnectionUri, handler: Arc<dyn ConnectionHandler>, mode: ConnectionMode) -> anyhow::Result<Arc<dyn PersistentConnection>> {
        let uri = uri.clone();
        let tuning = ctx.config.kcp.clone();
        let mtu = ctx.config.mtu;
        let connect = async move {
            let addr = uri.resolve().await?;
            let udp = UdpLink::connect(addr, false).await?;
            KcpLink::consult(udp, &tuning, mtu)
        }.boxed();
        Ok(Connection::connecting("kcp", connect, handler, mode, &ctx.config, &ctx.pool, None))
    }

    async fn bind(&self, ctx: &TransportContext, uri: &ConnectionUri) -> anyhow::Result<Arc<dyn ConnectionListener>> {
        let addr = uri.resolve().await?;
        Ok(Arc::new(KcpServer::bind(addr, ctx.clone()).await?))
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    /// one end of an in-memory datagram pipe
    #[derive(Clone, Default)]
    struct PipeEnd {
        inbox: Arc<Mutex<VecDeque<Vec<u8>>>>,
        outbox: Arc<Mutex<VecDeque<Vec<u8>>>>,
    }

    fn pipe() -> (PipeEnd, PipeEnd) {
        let a = PipeEnd::default();
        let b = PipeEnd {
            inbox: a.outbox.clone(),
            outbox: a.inbox.clone(),
        };
        (a, b)
    }

    #[async_trait]
    impl Link for PipeEnd {
        fn max_receive_size(&self) -> usize {
            MAX_DATAGRAM_SIZE
        }

        fn try_recv(&mut self, buf: &mut [u8]) -> anyhow::Result<RecvOutcome> {
            match self.inbox.lock().unwrap().pop_front() {
                Some(d) => {
                    buf[..d.len()].copy_from_slice(&d);
                    Ok(RecvOutcome::Data(d.len()))
                }
                None => Ok(RecvOutcome::WouldBlock),
            }
        }

        fn send(&mut self, data: &[u8]) -> anyhow::Result<()> {
            self.outbox.lock().unwrap().push_back(data.to_vec());
            Ok(())
        }

        fn flush(&mut self) -> anyhow::Result<()> {
            Ok(())
        }

        async fn ready(&mut self, _want_write: bool) -> anyhow::Result<()> {
            tokio::task::yield_now().await;
            Ok(())
        }

        fn remote_addr(&self) -> Option<SocketAddr> {
            None
        }
    }

    fn receive_all<L: Link>(link: &mut KcpLink<L>) -> Vec<Vec<u8>> {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let mut result = Vec::new();
        while let RecvOutcome::Data(n) = link.try_recv(&mut buf).unwrap() {
            result.push(buf[..n].to_vec());
        }
        result
    }

    const MTU: usize = 200;

    #[rstest]
    #[case::request(ConsultMessage::Request { nonce: 0x0102030405060708 }, vec![1, 1, 2, 3, 4, 5, 6, 7, 8])]
    #[case::assign(ConsultMessage::Assign { nonce: 9, conv: 0x00010002 }, vec![2, 0, 0, 0, 0, 0, 0, 0, 9, 0, 1, 0, 2])]
    fn test_consult_message(#[case] msg: ConsultMessage, #[case] expected: Vec<u8>) {
        let mut buf = BytesMut::new();
        msg.ser(&mut buf);
        assert_eq!(buf.as_ref(), expected.as_slice());
        assert_eq!(ConsultMessage::deser(&buf).unwrap(), msg);
    }

    #[rstest]
    #[case::empty(vec![])]
    #[case::unknown_kind(vec![7, 0, 0, 0, 0, 0, 0, 0, 1])]
    #[case::truncated(vec![2, 0, 0, 0, 0, 0, 0, 0, 1, 0])]
    #[case::trailing(vec![1, 0, 0, 0, 0, 0, 0, 0, 1, 0])]
    fn test_consult_message_invalid(#[case] bytes: Vec<u8>) {
        assert!(ConsultMessage::deser(&bytes).is_err());
    }

    #[test]
    fn test_conv_of() {
        let mut segment = vec![0u8; KcpTuning::SEGMENT_OVERHEAD];
        segment[..4].copy_from_slice(&0x12345678u32.to_le_bytes());
        assert_eq!(conv_of(&segment), Some(0x12345678));
        assert_eq!(conv_of(&segment[..10]), None);
    }

    #[test]
    fn test_large_message_is_chunked_and_delivered() {
        let (a, b) = pipe();
        let tuning = KcpTuning::default();
        let mut sender = KcpLink::new(a, 7, &tuning, MTU).unwrap();
        let mut receiver = KcpLink::new(b.clone(), 7, &tuning, MTU).unwrap();

        let mss = MTU - KcpTuning::SEGMENT_OVERHEAD;
        let data = (0..3 * MTU + 17).map(|i| (i % 251) as u8).collect::<Vec<_>>();
        sender.send(&data).unwrap();
        sender.flush().unwrap();

        assert!(b.inbox.lock().unwrap().iter().all(|d| d.len() <= MTU));
        let chunks = receive_all(&mut receiver);
        assert!(chunks.iter().all(|c| c.len() <= mss));
        assert_eq!(chunks.len(), data.len().div_ceil(mss));
        assert_eq!(chunks.concat(), data);
    }

    #[test]
    fn test_other_conversation_is_ignored() {
        let (a, b) = pipe();
        let tuning = KcpTuning::default();
        let mut sender = KcpLink::new(a, 7, &tuning, MTU).unwrap();
        let mut receiver = KcpLink::new(b, 8, &tuning, MTU).unwrap();

        sender.send(b"hello").unwrap();
        sender.flush().unwrap();
        assert!(receive_all(&mut receiver).is_empty());
    }

    #[test]
    fn test_consult_handshake() {
        let (client_end, server_end) = pipe();
        let tuning = KcpTuning::default();
        let mut client = KcpLink::consult(client_end, &tuning, MTU).unwrap();
        client.send(b"held back").unwrap();
        client.flush().unwrap();

        let requests = server_end.inbox.lock().unwrap().drain(..).collect::<Vec<_>>();
        assert!(requests.iter().all(|d| conv_of(d) == Some(CONSULT_CONV)));

        let mut session = ConsultSession::new(&tuning, MTU, 0).unwrap();
        let nonce = requests.iter()
            .find_map(|d| session.input(d))
            .unwrap();
        let conv = ConnectionId { index: 5, generation: 1 }.to_conv();
        session.assign(nonce, conv).unwrap();
        while let Some(d) = session.outbox.pop() {
            server_end.outbox.lock().unwrap().push_back(d.to_vec());
        }

        assert!(receive_all(&mut client).is_empty());
        assert_eq!(client.kcp.conv(), conv);
        assert!(matches!(client.phase, Phase::Established));

        client.flush().unwrap();
        let after = server_end.inbox.lock().unwrap().drain(..).collect::<Vec<_>>();
        let mut server = KcpLink::new(PipeEnd::default(), conv, &tuning, MTU).unwrap();
        for d in after.iter().filter(|d| conv_of(d) == Some(conv)) {
            server.datagram[..d.len()].copy_from_slice(d);
            server.input(d.len()).unwrap();
        }
        assert_eq!(receive_all(&mut server), vec![b"held back".to_vec()]);
    }

    #[test]
    fn test_consult_ignores_foreign_nonce() {
        let (client_end, server_end) = pipe();
        let tuning = KcpTuning::default();
        let mut client = KcpLink::consult(client_end, &tuning, MTU).unwrap();
        client.flush().unwrap();

        let mut session = ConsultSession::new(&tuning, MTU, 0).unwrap();
        let nonce = server_end.inbox.lock().unwrap().drain(..)
            .find_map(|d| session.input(&d))
            .unwrap();
        session.assign(nonce.wrapping_add(1), 99).unwrap();
        while let Some(d) = session.outbox.pop() {
            server_end.outbox.lock().unwrap().push_back(d.to_vec());
        }

        receive_all(&mut client);
        assert!(matches!(client.phase, Phase::Consulting { .. }));
        assert_eq!(client.kcp.conv(), CONSULT_CONV);
    }

    async fn consult_listener(tuning: &KcpTuning) -> ConsultListener {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        socket.writable().await.unwrap();
        ConsultListener {
            socket: Arc::new(socket),
            routes: Default::default(),
            backlog: Arc::new(ConcurrentRingQueue::new(4)),
            backlog_notify: Default::default(),
            sessions: Default::default(),
            tuning: tuning.clone(),
            mtu: MTU,
            epoch: Instant::now(),
        }
    }

    /// Runs a client's consult handshake against `listener`, with the client's datagrams coming
    ///  from `peer`'s address
    async fn consult_from(listener: &mut ConsultListener, peer: &UdpSocket, tuning: &KcpTuning) -> u32 {
        let (client_end, server_end) = pipe();
        let mut client = KcpLink::consult(client_end, tuning, MTU).unwrap();
        client.flush().unwrap();
        let remote = peer.local_addr().unwrap();
        for d in server_end.inbox.lock().unwrap().drain(..) {
            listener.on_datagram(&d, remote);
        }

        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        while matches!(client.phase, Phase::Consulting { .. }) {
            let (n, _) = tokio::time::timeout(Duration::from_secs(2), peer.recv_from(&mut buf)).await
                .expect("no assignment from the server")
                .unwrap();
            server_end.outbox.lock().unwrap().push_back(buf[..n].to_vec());
            receive_all(&mut client);
        }
        client.kcp.conv()
    }

    #[tokio::test]
    async fn test_restarted_peer_gets_a_new_conversation() {
        let tuning = KcpTuning::default();
        let mut listener = consult_listener(&tuning).await;
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let first = consult_from(&mut listener, &peer, &tuning).await;
        // same address and port, new handshake, well within the consult timeout
        let second = consult_from(&mut listener, &peer, &tuning).await;

        assert_ne!(first, CONSULT_CONV);
        assert_ne!(second, CONSULT_CONV);
        assert_ne!(first, second);
        assert_eq!(listener.routes.lock().unwrap().len(), 2);
        assert_eq!(listener.sessions.len(), 1);
    }

    #[test]
    fn test_starting_request() {
        let (client_end, server_end) = pipe();
        let tuning = KcpTuning::default();
        let mut client = KcpLink::consult(client_end, &tuning, MTU).unwrap();
        client.flush().unwrap();
        let Phase::Consulting { nonce, .. } = client.phase else {
            panic!("not consulting");
        };

        let datagrams = server_end.inbox.lock().unwrap().drain(..).collect::<Vec<_>>();
        assert_eq!(datagrams.iter().find_map(|d| starting_request(d)), Some(nonce));
        assert_eq!(starting_request(&datagrams[0][..10]), None);

        // a request in a later segment is a retransmission at best
        let mut request = BytesMut::new();
        ConsultMessage::Request { nonce: 5 }.ser(&mut request);
        let (a, b) = pipe();
        let mut sender = KcpLink::new(a, CONSULT_CONV, &tuning, MTU).unwrap();
        sender.send(&request).unwrap();
        sender.flush().unwrap();
        let first = b.inbox.lock().unwrap().drain(..).collect::<Vec<_>>();
        assert_eq!(first.iter().find_map(|d| starting_request(d)), Some(5));

        sender.send(&request).unwrap();
        sender.flush().unwrap();
        let second = b.inbox.lock().unwrap().drain(..).collect::<Vec<_>>();
        assert!(!second.is_empty());
        assert!(second.iter().all(|d| starting_request(d).is_none()));
    }

    #[test]
    fn test_consult_timeout() {
        let tuning = KcpTuning {
            consult_timeout: Duration::ZERO,
            ..Default::default()
        };
        let mut client = KcpLink::consult(PipeEnd::default(), &tuning, MTU).unwrap();
        std::thread::sleep(Duration::from_millis(2));
        assert!(client.on_tick().is_err());
    }

    #[test]
    fn test_on_tick_is_bounded_by_update_interval() {
        let tuning = KcpTuning::default();
        let mut link = KcpLink::new(PipeEnd::default(), 1, &tuning, MTU).unwrap();
        let wait = link.on_tick().unwrap().unwrap();
        assert!(wait <= tuning.update_interval);
    }

    #[test]
    fn test_conv_from_path() {
        let parse = |s: &str| conv_from_path(&ConnectionUri::parse(s).unwrap());
        assert_eq!(parse("kcpraw://h:1/17").unwrap(), 17);
        assert!(parse("kcpraw://h:1/0").is_err());
        assert!(parse("kcpraw://h:1").is_err());
        assert!(parse("kcpraw://h:1/x").is_err());
    }
}
