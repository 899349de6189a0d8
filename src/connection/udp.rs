use std::collections::VecDeque;
use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::pin::pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use anyhow::{anyhow, bail};
use async_trait::async_trait;
use futures::future::select_all;
use futures::FutureExt;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, trace};
use crate::connection::driver::{Connection, Link, RecvOutcome};
use crate::connection::registry::{ConnectionUri, TransportContext, TransportFactory};
use crate::connection::{ConnectionHandler, ConnectionListener, ConnectionMode, MessageRejected, PersistentConnection};

/// the biggest UDP payload
pub(crate) const MAX_DATAGRAM_SIZE: usize = 65_536;

/// the biggest payload that fits into a single datagram
pub(crate) const MAX_UDP_PAYLOAD: usize = 65_507;

/// Datagrams that hit a full socket buffer wait for the socket to become writable. Beyond this
///  many, the oldest are dropped.
const MAX_QUEUED_DATAGRAMS: usize = 256;

/// ICMP 'port unreachable' surfaces as an error on the next socket operation. For a connection
///  that may outlive a restarting peer, this is no reason to give up.
pub(crate) fn is_transient(kind: ErrorKind) -> bool {
    matches!(kind, ErrorKind::WouldBlock | ErrorKind::Interrupted | ErrorKind::ConnectionRefused | ErrorKind::ConnectionReset)
}

fn check_datagram_size(len: usize) -> anyhow::Result<()> {
    if len > MAX_UDP_PAYLOAD {
        return Err(MessageRejected(format!("{} bytes do not fit into a UDP datagram (max {})", len, MAX_UDP_PAYLOAD)).into());
    }
    Ok(())
}

/// `Ok(false)` if the socket buffer is full, so the datagram must be retried once the socket is
///  writable. Other errors concern only this datagram.
fn datagram_sent(result: std::io::Result<usize>) -> anyhow::Result<bool> {
    match result {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(false),
        Err(e) if is_transient(e.kind()) => {
            trace!("dropping datagram: {}", e);
            Ok(true)
        }
        Err(e) => Err(MessageRejected(e.to_string()).into()),
    }
}

fn enqueue<T>(queue: &mut VecDeque<T>, value: T) {
    if queue.len() >= MAX_QUEUED_DATAGRAMS {
        queue.pop_front();
        debug!("socket stays unwritable: dropping the oldest queued datagram");
    }
    queue.push_back(value);
}

fn unspecified_for(addr: &SocketAddr) -> SocketAddr {
    match addr {
        SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    }
}

/// A UDP socket connected to a single peer. Each `send()` is one datagram.
pub(crate) struct UdpLink {
    socket: UdpSocket,
    remote: SocketAddr,
    /// the datagram that identified the peer of a server side link
    first: Option<Vec<u8>>,
    /// datagrams waiting for the socket to become writable, in send order
    queued: VecDeque<Vec<u8>>,
}

impl UdpLink {
    pub(crate) async fn connect(remote: SocketAddr, broadcast: bool) -> anyhow::Result<UdpLink> {
        let socket = UdpSocket::bind(unspecified_for(&remote)).await?;
        if broadcast {
            socket.set_broadcast(true)?;
        }
        socket.connect(remote).await?;
        // tokio's try_send() fails until the socket was seen writable once
        socket.writable().await?;
        debug!(local = ?socket.local_addr().ok(), %remote, "UDP socket connected");
        Ok(UdpLink {
            socket,
            remote,
            first: None,
            queued: VecDeque::new(),
        })
    }

    pub(crate) async fn accepted(socket: UdpSocket, remote: SocketAddr, first: Vec<u8>) -> anyhow::Result<UdpLink> {
        socket.connect(remote).await?;
        socket.writable().await?;
        Ok(UdpLink {
            socket,
            remote,
            first: Some(first),
            queued: VecDeque::new(),
        })
    }
}

#[async_trait]
impl Link for UdpLink {
    fn max_receive_size(&self) -> usize {
        MAX_DATAGRAM_SIZE
    }

    fn try_recv(&mut self, buf: &mut [u8]) -> anyhow::Result<RecvOutcome> {
        if let Some(first) = self.first.take() {
            buf[..first.len()].copy_from_slice(&first);
            return Ok(RecvOutcome::Data(first.len()));
        }

        match self.socket.try_recv(buf) {
            Ok(n) => Ok(RecvOutcome::Data(n)),
            Err(e) if is_transient(e.kind()) => {
                if e.kind() != ErrorKind::WouldBlock {
                    debug!("ignoring transient UDP error: {}", e);
                }
                Ok(RecvOutcome::WouldBlock)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn send(&mut self, data: &[u8]) -> anyhow::Result<()> {
        check_datagram_size(data.len())?;
        if self.queued.is_empty() && datagram_sent(self.socket.try_send(data))? {
            return Ok(());
        }
        trace!(queued = self.queued.len(), "socket is not writable: queueing datagram");
        enqueue(&mut self.queued, data.to_vec());
        Ok(())
    }

    fn flush(&mut self) -> anyhow::Result<()> {
        while let Some(datagram) = self.queued.front() {
            match datagram_sent(self.socket.try_send(datagram)) {
                Ok(false) => break,
                Ok(true) => {}
                Err(e) => debug!("dropping queued datagram: {}", e),
            }
            self.queued.pop_front();
        }
        Ok(())
    }

    fn wants_write(&self) -> bool {
        !self.queued.is_empty()
    }

    async fn ready(&mut self, want_write: bool) -> anyhow::Result<()> {
        if self.first.is_some() {
            return Ok(());
        }
        if want_write {
            tokio::select! {
                r = self.socket.readable() => r?,
                r = self.socket.writable() => r?,
            }
        }
        else {
            self.socket.readable().await?;
        }
        Ok(())
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        Some(self.remote)
    }
}

/// One socket of a fan-out server, with the peers recently seen on it (most recent first)
struct InterfaceSocket {
    socket: UdpSocket,
    local: SocketAddr,
    recent: VecDeque<SocketAddr>,
}

impl InterfaceSocket {
    fn touch(&mut self, remote: SocketAddr, capacity: usize) {
        match self.recent.iter().position(|r| *r == remote) {
            Some(0) => return,
            Some(pos) => {
                self.recent.remove(pos);
            }
            None => debug!(local = %self.local, %remote, "new UDP peer"),
        }
        self.recent.push_front(remote);
        if self.recent.len() > capacity {
            if let Some(evicted) = self.recent.pop_back() {
                debug!(local = %self.local, %evicted, "forgetting UDP peer");
            }
        }
    }
}

/// The server side of broadcast / multicast UDP: one socket per local interface. A sent datagram
///  goes to every peer recently seen on any interface, through the socket it was seen on.
pub(crate) struct FanOutLink {
    interfaces: Vec<InterfaceSocket>,
    next: usize,
    recent_capacity: usize,
    /// (interface index, remote, datagram) waiting for the interface's socket to become writable
    queued: VecDeque<(usize, SocketAddr, Vec<u8>)>,
}

impl FanOutLink {
    fn new(sockets: Vec<UdpSocket>, recent_capacity: usize) -> anyhow::Result<FanOutLink> {
        if sockets.is_empty() {
            bail!("fan-out UDP requires at least one interface");
        }
        let interfaces = sockets.into_iter()
            .map(|socket| Ok(InterfaceSocket {
                local: socket.local_addr()?,
                socket,
                recent: VecDeque::new(),
            }))
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(FanOutLink {
            interfaces,
            next: 0,
            recent_capacity,
            queued: VecDeque::new(),
        })
    }

    #[cfg(test)]
    fn recent_remotes(&self) -> Vec<SocketAddr> {
        self.interfaces.iter()
            .flat_map(|i| i.recent.iter().copied())
            .collect()
    }
}

#[async_trait]
impl Link for FanOutLink {
    fn max_receive_size(&self) -> usize {
        MAX_DATAGRAM_SIZE
    }

    fn try_recv(&mut self, buf: &mut [u8]) -> anyhow::Result<RecvOutcome> {
        let n = self.interfaces.len();
        for i in 0..n {
            let idx = (self.next + i) % n;
            let iface = &mut self.interfaces[idx];
            match iface.socket.try_recv_from(buf) {
                Ok((len, remote)) => {
                    iface.touch(remote, self.recent_capacity);
                    // round robin, so a busy interface can not starve the others
                    self.next = (idx + 1) % n;
                    return Ok(RecvOutcome::Data(len));
                }
                Err(e) if is_transient(e.kind()) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(RecvOutcome::WouldBlock)
    }

    fn send(&mut self, data: &[u8]) -> anyhow::Result<()> {
        check_datagram_size(data.len())?;
        let queue_all = !self.queued.is_empty();
        for (idx, iface) in self.interfaces.iter().enumerate() {
            for remote in &iface.recent {
                if queue_all {
                    enqueue(&mut self.queued, (idx, *remote, data.to_vec()));
                    continue;
                }
                match datagram_sent(iface.socket.try_send_to(data, *remote)) {
                    Ok(true) => {}
                    Ok(false) => enqueue(&mut self.queued, (idx, *remote, data.to_vec())),
                    // one unreachable peer does not fail the message for the others
                    Err(e) => trace!(%remote, "dropping datagram: {}", e),
                }
            }
        }
        Ok(())
    }

    fn flush(&mut self) -> anyhow::Result<()> {
        while let Some((idx, remote, datagram)) = self.queued.front() {
            match datagram_sent(self.interfaces[*idx].socket.try_send_to(datagram, *remote)) {
                Ok(false) => break,
                Ok(true) => {}
                Err(e) => trace!(%remote, "dropping queued datagram: {}", e),
            }
            self.queued.pop_front();
        }
        Ok(())
    }

    fn wants_write(&self) -> bool {
        !self.queued.is_empty()
    }

    async fn ready(&mut self, want_write: bool) -> anyhow::Result<()> {
        let mut waits = self.interfaces.iter()
            .map(|i| i.socket.readable().boxed())
            .collect::<Vec<_>>();
        if want_write {
            waits.extend(self.interfaces.iter().map(|i| i.socket.writable().boxed()));
        }
        let (result, _, _) = select_all(waits).await;
        result?;
        Ok(())
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        None
    }
}

fn bind_interface_socket(addr: SocketAddr, multicast: Option<Ipv4Addr>) -> anyhow::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    if addr.is_ipv4() {
        socket.set_broadcast(true)?;
    }
    socket.bind(&addr.into())?;

    if let Some(group) = multicast {
        let IpAddr::V4(iface) = addr.ip() else {
            bail!("multicast requires IPV4 interfaces, got {}", addr);
        };
        socket.join_multicast_v4(&group, &iface)?;
        socket.set_multicast_if_v4(&iface)?;
        debug!(%group, %iface, "joined multicast group");
    }
    Ok(UdpSocket::from_std(socket.into())?)
}

enum ServerSockets {
    Unicast(UdpSocket),
    FanOut(FanOutLink),
}

/// Server side UDP. There is exactly one connection per server: in unicast mode it is bound to
///  the first peer that sends a datagram, in fan-out mode it talks to all recently seen peers.
pub struct UdpServer {
    local_addrs: Vec<SocketAddr>,
    sockets: Mutex<Option<ServerSockets>>,
    closed: AtomicBool,
    closed_notify: Notify,
    context: TransportContext,
}

impl UdpServer {
    pub async fn bind_unicast(addr: SocketAddr, context: TransportContext) -> anyhow::Result<UdpServer> {
        let socket = UdpSocket::bind(addr).await?;
        let local_addr = socket.local_addr()?;
        info!(%local_addr, "UDP server bound");
        Ok(Self::new(vec![local_addr], ServerSockets::Unicast(socket), context))
    }

    /// Binds one socket per interface address, all on the same port
    pub async fn bind_fan_out(interfaces: &[IpAddr], port: u16, multicast: Option<Ipv4Addr>, context: TransportContext) -> anyhow::Result<UdpServer> {
        let mut port = port;
        let mut sockets = Vec::new();
        for iface in interfaces {
            let socket = bind_interface_socket((*iface, port).into(), multicast)?;
            port = socket.local_addr()?.port();
            sockets.push(socket);
        }
        let link = FanOutLink::new(sockets, context.config.udp_recent_remotes)?;
        let local_addrs = link.interfaces.iter().map(|i| i.local).collect::<Vec<_>>();
        info!(?local_addrs, ?multicast, "fan-out UDP server bound");
        Ok(Self::new(local_addrs, ServerSockets::FanOut(link), context))
    }

    fn new(local_addrs: Vec<SocketAddr>, sockets: ServerSockets, context: TransportContext) -> UdpServer {
        UdpServer {
            local_addrs,
            sockets: Mutex::new(Some(sockets)),
            closed: AtomicBool::new(false),
            closed_notify: Notify::new(),
            context,
        }
    }

    async fn wait_closed(&self) {
        loop {
            let mut notified = pin!(self.closed_notify.notified());
            notified.as_mut().enable();
            if self.closed.load(Ordering::Acquire) {
                return;
            }
            notified.await;
        }
    }

    fn connection<L: Link>(&self, link: L, handler: Arc<dyn ConnectionHandler>, mode: ConnectionMode) -> Arc<dyn PersistentConnection> {
        Connection::established("udp", link, handler, mode, &self.context.config, &self.context.pool)
    }
}

/// What a UDP server hands out: its single link
pub(crate) enum ServerLink {
    Unicast(UdpLink),
    FanOut(FanOutLink),
}

impl UdpServer {
    async fn first_datagram(&self, socket: &UdpSocket) -> anyhow::Result<(Vec<u8>, SocketAddr)> {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            let received = tokio::select! {
                r = socket.recv_from(&mut buf) => r,
                _ = self.wait_closed() => bail!("UDP server is closed"),
            };
            match received {
                Ok((n, remote)) => {
                    buf.truncate(n);
                    return Ok((buf, remote));
                }
                Err(e) if is_transient(e.kind()) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Waits for the first peer in unicast mode, returns right away in fan-out mode
    pub(crate) async fn accept_link(&self) -> anyhow::Result<ServerLink> {
        if self.closed.load(Ordering::Acquire) {
            bail!("UDP server is closed");
        }
        let mut sockets = self.sockets.lock().await;
        let first = match sockets.as_ref() {
            Some(ServerSockets::Unicast(socket)) => Some(self.first_datagram(socket).await?),
            _ => None,
        };

        match (sockets.take(), first) {
            (Some(ServerSockets::Unicast(socket)), Some((data, remote))) => {
                debug!(%remote, "UDP peer bound to server connection");
                Ok(ServerLink::Unicast(UdpLink::accepted(socket, remote, data).await?))
            }
            (Some(ServerSockets::FanOut(link)), _) => Ok(ServerLink::FanOut(link)),
            _ => bail!("a UDP server has only a single connection"),
        }
    }
}

#[async_trait]
impl ConnectionListener for UdpServer {
    /// In fan-out mode, this returns the server's single connection right away
    async fn accept(&self, handler: Arc<dyn ConnectionHandler>, mode: ConnectionMode) -> anyhow::Result<Arc<dyn PersistentConnection>> {
        Ok(match self.accept_link().await? {
            ServerLink::Unicast(link) => self.connection(link, handler, mode),
            ServerLink::FanOut(link) => self.connection(link, handler, mode),
        })
    }

    fn local_addrs(&self) -> Vec<SocketAddr> {
        self.local_addrs.clone()
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            info!(local_addrs = ?self.local_addrs, "closing UDP server");
        }
        self.closed_notify.notify_waiters();
        if let Ok(mut sockets) = self.sockets.try_lock() {
            sockets.take();
        }
    }
}

/// Parses the fan-out options of a URI: `broadcast`, `multicast=<group>` and
///  `interfaces=<ip>,<ip>,...`. Returns `None` for plain unicast.
fn fan_out_options(uri: &ConnectionUri, host: IpAddr) -> anyhow::Result<Option<(Vec<IpAddr>, Option<Ipv4Addr>)>> {
    let broadcast = uri.option("broadcast").is_some_and(|v| v != "false");
    let multicast = uri.option("multicast")
        .map(|g| g.parse::<Ipv4Addr>().map_err(|e| anyhow!("invalid multicast group {}: {}", g, e)))
        .transpose()?;
    let interfaces = uri.option("interfaces")
        .map(|s| s.split(',')
            .map(|ip| ip.trim().parse::<IpAddr>().map_err(|e| anyhow!("invalid interface address {}: {}", ip, e)))
            .collect::<anyhow::Result<Vec<_>>>())
        .transpose()?;

    if !broadcast && multicast.is_none() && interfaces.is_none() {
        return Ok(None);
    }
    Ok(Some((interfaces.unwrap_or_else(|| vec![host]), multicast)))
}

/// Binds a unicast or fan-out server, depending on the URI's options
pub(crate) async fn bind_server(uri: &ConnectionUri, ctx: &TransportContext) -> anyhow::Result<UdpServer> {
    let addr = uri.resolve().await?;
    match fan_out_options(uri, addr.ip())? {
        None => UdpServer::bind_unicast(addr, ctx.clone()).await,
        Some((interfaces, multicast)) => UdpServer::bind_fan_out(&interfaces, addr.port(), multicast, ctx.clone()).await,
    }
}

/// `udp://host:port`. Servers accept `broadcast`, `multicast=<group>` and `interfaces=<list>` for
///  fan-out mode, clients accept `broadcast` for sending to a broadcast address.
pub struct UdpTransport;

#[async_trait]
impl TransportFactory for UdpTransport {
    fn connect(&self, ctx: &TransportContext, uri: &ConnectionUri, handler: Arc<dyn ConnectionHandler>, mode: ConnectionMode) -> anyhow::Result<Arc<dyn PersistentConnection>> {
        let uri = uri.clone();
        let broadcast = uri.option("broadcast").is_some_and(|v| v != "false");
        let connect = async move {
            let addr = uri.resolve().await?;
            UdpLink::connect(addr, broadcast).await
        }.boxed();
        Ok(Connection::connecting("udp", connect, handler, mode, &ctx.config, &ctx.pool, None))
    }

    async fn bind(&self, ctx: &TransportContext, uri: &ConnectionUri) -> anyhow::Result<Arc<dyn ConnectionListener>> {
        Ok(Arc::new(bind_server(uri, ctx).await?))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;
    use tokio::time::timeout;
    use crate::config::TransportConfig;
    use crate::connection::MockConnectionHandler;
    use super::*;

    fn context() -> TransportContext {
        TransportContext::new(TransportConfig {
            max_wait: Duration::from_millis(20),
            udp_recent_remotes: 2,
            ..Default::default()
        }).unwrap()
    }

    fn recording_handler(received: Arc<StdMutex<Vec<Vec<u8>>>>) -> MockConnectionHandler {
        let mut handler = MockConnectionHandler::new();
        handler.expect_on_receive()
            .returning(move |data| received.lock().unwrap().push(data.to_vec()));
        handler.expect_on_update().returning(|| None);
        handler.expect_on_close().return_const(());
        handler
    }

    async fn wait_for(received: &Arc<StdMutex<Vec<Vec<u8>>>>, n: usize) {
        timeout(Duration::from_secs(5), async {
            while received.lock().unwrap().len() < n {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }).await.unwrap();
    }

    #[tokio::test]
    async fn test_recent_remotes_lru() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut iface = InterfaceSocket { local: socket.local_addr().unwrap(), socket, recent: VecDeque::new() };
        let a: SocketAddr = "10.0.0.1:1".parse().unwrap();
        let b: SocketAddr = "10.0.0.2:1".parse().unwrap();
        let c: SocketAddr = "10.0.0.3:1".parse().unwrap();

        iface.touch(a, 2);
        iface.touch(b, 2);
        iface.touch(a, 2);
        assert_eq!(iface.recent, vec![a, b]);
        iface.touch(c, 2);
        assert_eq!(iface.recent, vec![c, a]);
    }

    #[tokio::test]
    async fn test_unicast_server_binds_first_peer() {
        let ctx = context();
        let server = UdpServer::bind_unicast("127.0.0.1:0".parse().unwrap(), ctx.clone()).await.unwrap();
        let server_addr = server.local_addrs()[0];

        let client_received = Arc::new(StdMutex::new(Vec::new()));
        let uri = ConnectionUri::parse(&format!("udp://{}", server_addr)).unwrap();
        let client = UdpTransport.connect(&ctx, &uri, Arc::new(recording_handler(client_received.clone())), ConnectionMode::Threaded).unwrap();
        client.start_connect().unwrap();
        client.send(span(b"first").into()).unwrap();

        let server_received = Arc::new(StdMutex::new(Vec::new()));
        let conn = timeout(Duration::from_secs(5), server.accept(Arc::new(recording_handler(server_received.clone())), ConnectionMode::Threaded)).await.unwrap().unwrap();
        conn.start_connect().unwrap();
        assert!(conn.remote_addr().is_some());

        wait_for(&server_received, 1).await;
        assert_eq!(server_received.lock().unwrap()[0], b"first");

        conn.send(span(b"reply").into()).unwrap();
        wait_for(&client_received, 1).await;
        assert_eq!(client_received.lock().unwrap()[0], b"reply");

        assert!(server.accept(Arc::new(MockConnectionHandler::new()), ConnectionMode::Threaded).await.is_err());
        client.dispose();
        conn.dispose();
    }

    #[tokio::test]
    async fn test_fan_out_replies_to_all_peers() {
        let ctx = context();
        let uri = ConnectionUri::parse("udp://127.0.0.1:0?broadcast").unwrap();
        let server = UdpTransport.bind(&ctx, &uri).await.unwrap();
        let server_addr = server.local_addrs()[0];

        let server_received = Arc::new(StdMutex::new(Vec::new()));
        let conn = server.accept(Arc::new(recording_handler(server_received.clone())), ConnectionMode::Threaded).await.unwrap();
        conn.start_connect().unwrap();

        let peer_a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer_b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        peer_a.send_to(b"a", server_addr).await.unwrap();
        peer_b.send_to(b"b", server_addr).await.unwrap();
        wait_for(&server_received, 2).await;

        conn.send(span(b"all").into()).unwrap();
        let mut buf = [0u8; 16];
        for peer in [&peer_a, &peer_b] {
            let n = timeout(Duration::from_secs(5), peer.recv(&mut buf)).await.unwrap().unwrap();
            assert_eq!(&buf[..n], b"all");
        }
        conn.dispose();
    }

    #[tokio::test]
    async fn test_fan_out_link_round_robin() {
        let ctx = context();
        let server = UdpServer::bind_fan_out(&["127.0.0.1".parse().unwrap()], 0, None, ctx).await.unwrap();
        let addr = server.local_addrs()[0];
        let Some(ServerSockets::FanOut(mut link)) = server.sockets.lock().await.take() else {
            panic!("not a fan-out server");
        };

        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        peer.send_to(b"x", addr).await.unwrap();
        timeout(Duration::from_secs(5), link.ready(false)).await.unwrap().unwrap();

        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        assert_eq!(link.try_recv(&mut buf).unwrap(), RecvOutcome::Data(1));
        assert_eq!(link.recent_remotes(), vec![peer.local_addr().unwrap()]);
        assert_eq!(link.try_recv(&mut buf).unwrap(), RecvOutcome::WouldBlock);
    }

    #[test]
    fn test_fan_out_options() {
        let host: IpAddr = "0.0.0.0".parse().unwrap();
        let parse = |s: &str| fan_out_options(&ConnectionUri::parse(s).unwrap(), host);

        assert_eq!(parse("udp://0.0.0.0:1").unwrap(), None);
        assert_eq!(parse("udp://0.0.0.0:1?broadcast=false").unwrap(), None);
        assert_eq!(parse("udp://0.0.0.0:1?broadcast").unwrap(), Some((vec![host], None)));
        assert_eq!(
            parse("udp://0.0.0.0:1?multicast=239.0.0.1&interfaces=10.0.0.1,10.0.0.2").unwrap(),
            Some((vec!["10.0.0.1".parse().unwrap(), "10.0.0.2".parse().unwrap()], Some(Ipv4Addr::new(239, 0, 0, 1)))),
        );
        assert!(parse("udp://0.0.0.0:1?multicast=nonsense").is_err());
    }

    fn span(data: &[u8]) -> crate::buffers::pooled_buffer::BufferSpan {
        let mut buf = crate::buffers::buffer_pool::BufferPool::global().get_buffer(data.len());
        buf.spare_mut()[..data.len()].copy_from_slice(data);
        buf.commit(data.len());
        buf.freeze().full_span()
    }
}
