use std::io::ErrorKind;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::pin::pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use anyhow::{anyhow, bail};
use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use futures::FutureExt;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::Interest;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use crate::buffers::ring_queue::ConcurrentRingQueue;
use crate::connection::driver::{Connection, Link, RecvOutcome};
use crate::connection::registry::{ConnectionUri, TransportContext, TransportFactory};
use crate::connection::{ConnectionHandler, ConnectionListener, ConnectionMode, PersistentConnection};

const LISTEN_BACKLOG: i32 = 1024;

/// back-off after a failed `accept()`, e.g. when running out of file descriptors
const ACCEPT_ERROR_PAUSE: Duration = Duration::from_millis(100);

/// A TCP stream plus the data that did not fit into the socket's send buffer yet
pub(crate) struct TcpLink {
    stream: TcpStream,
    pending: BytesMut,
    remote: Option<SocketAddr>,
    max_receive_size: usize,
}

impl TcpLink {
    pub(crate) fn new(stream: TcpStream, max_receive_size: usize) -> anyhow::Result<TcpLink> {
        stream.set_nodelay(true)?;
        Ok(TcpLink {
            remote: stream.peer_addr().ok(),
            stream,
            pending: BytesMut::new(),
            max_receive_size,
        })
    }

    pub(crate) async fn connect(addr: SocketAddr, max_receive_size: usize) -> anyhow::Result<TcpLink> {
        debug!(%addr, "connecting TCP");
        let stream = TcpStream::connect(addr).await?;
        TcpLink::new(stream, max_receive_size)
    }

    /// Writes as much as possible without blocking, returns the number of bytes written
    fn write_now(&self, data: &[u8]) -> anyhow::Result<usize> {
        let mut written = 0;
        while written < data.len() {
            match self.stream.try_write(&data[written..]) {
                Ok(0) => bail!("TCP stream does not accept data"),
                Ok(n) => written += n,
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(written)
    }
}

#[async_trait]
impl Link for TcpLink {
    fn max_receive_size(&self) -> usize {
        self.max_receive_size
    }

    fn try_recv(&mut self, buf: &mut [u8]) -> anyhow::Result<RecvOutcome> {
        match self.stream.try_read(buf) {
            Ok(0) => Ok(RecvOutcome::Closed),
            Ok(n) => Ok(RecvOutcome::Data(n)),
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::Interrupted => Ok(RecvOutcome::WouldBlock),
            Err(e) => Err(e.into()),
        }
    }

    fn send(&mut self, data: &[u8]) -> anyhow::Result<()> {
        if self.pending.is_empty() {
            let written = self.write_now(data)?;
            self.pending.extend_from_slice(&data[written..]);
        }
        else {
            // preserve ordering behind data that is already waiting
            self.pending.extend_from_slice(data);
        }
        Ok(())
    }

    fn flush(&mut self) -> anyhow::Result<()> {
        if !self.pending.is_empty() {
            let written = self.write_now(&self.pending)?;
            self.pending.advance(written);
        }
        Ok(())
    }

    fn wants_write(&self) -> bool {
        !self.pending.is_empty()
    }

    async fn ready(&mut self, want_write: bool) -> anyhow::Result<()> {
        let interest = if want_write {
            Interest::READABLE | Interest::WRITABLE
        }
        else {
            Interest::READABLE
        };
        self.stream.ready(interest).await?;
        Ok(())
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote
    }
}

fn bind_listener(addr: SocketAddr, only_v6: bool) -> anyhow::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    if addr.is_ipv6() {
        socket.set_only_v6(only_v6)?;
    }
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    Ok(TcpListener::from_std(socket.into())?)
}

/// Binds to a specific address, or to both the IPV6 and IPV4 wildcard addresses (on the same
///  port) if the address is unspecified
fn bind_listeners(addr: SocketAddr) -> anyhow::Result<Vec<TcpListener>> {
    if !addr.ip().is_unspecified() {
        return Ok(vec![bind_listener(addr, false)?]);
    }

    match bind_listener((Ipv6Addr::UNSPECIFIED, addr.port()).into(), true) {
        Ok(v6) => {
            let port = v6.local_addr()?.port();
            let v4 = bind_listener((Ipv4Addr::UNSPECIFIED, port).into(), false)?;
            Ok(vec![v6, v4])
        }
        Err(e) => {
            warn!("IPV6 is not available, listening on IPV4 only: {}", e);
            Ok(vec![bind_listener((Ipv4Addr::UNSPECIFIED, addr.port()).into(), false)?])
        }
    }
}

/// Accepts TCP connections on one or two listening sockets. Accepted streams wait in a bounded
///  backlog until the application claims them with `accept()`.
pub struct TcpServer {
    local_addrs: Vec<SocketAddr>,
    backlog: Arc<ConcurrentRingQueue<TcpStream>>,
    backlog_notify: Arc<Notify>,
    closed: Arc<AtomicBool>,
    accept_tasks: Mutex<Vec<JoinHandle<()>>>,
    context: TransportContext,
}

impl TcpServer {
    pub async fn bind(addr: SocketAddr, context: TransportContext) -> anyhow::Result<TcpServer> {
        let listeners = bind_listeners(addr)?;
        let local_addrs = listeners.iter()
            .map(|l| l.local_addr())
            .collect::<Result<Vec<_>, _>>()?;
        info!(?local_addrs, "TCP server listening");

        let backlog = Arc::new(ConcurrentRingQueue::new(context.config.tcp_backlog));
        let backlog_notify = Arc::new(Notify::new());
        let accept_tasks = listeners.into_iter()
            .map(|listener| tokio::spawn(Self::accept_loop(listener, backlog.clone(), backlog_notify.clone())))
            .collect();

        Ok(TcpServer {
            local_addrs,
            backlog,
            backlog_notify,
            closed: Default::default(),
            accept_tasks: Mutex::new(accept_tasks),
            context,
        })
    }

    async fn accept_loop(listener: TcpListener, backlog: Arc<ConcurrentRingQueue<TcpStream>>, notify: Arc<Notify>) {
        loop {
            match listener.accept().await {
                Ok((stream, remote)) => {
                    debug!(%remote, "accepted TCP connection");
                    if backlog.try_add(stream).is_err() {
                        warn!(%remote, "TCP backlog is full - closing connection");
                    }
                    notify.notify_waiters();
                }
                Err(e) => {
                    warn!("error accepting TCP connection: {}", e);
                    tokio::time::sleep(ACCEPT_ERROR_PAUSE).await;
                }
            }
        }
    }

    async fn next_stream(&self) -> anyhow::Result<TcpStream> {
        loop {
            let mut notified = pin!(self.backlog_notify.notified());
            notified.as_mut().enable();
            if self.closed.load(Ordering::Acquire) {
                bail!("TCP server is closed");
            }
            if let Some(stream) = self.backlog.try_take() {
                return Ok(stream);
            }
            notified.await;
        }
    }
}

#[async_trait]
impl ConnectionListener for TcpServer {
    async fn accept(&self, handler: Arc<dyn ConnectionHandler>, mode: ConnectionMode) -> anyhow::Result<Arc<dyn PersistentConnection>> {
        let stream = self.next_stream().await?;
        let link = TcpLink::new(stream, self.context.config.mtu)?;
        Ok(Connection::established("tcp", link, handler, mode, &self.context.config, &self.context.pool))
    }

    fn local_addrs(&self) -> Vec<SocketAddr> {
        self.local_addrs.clone()
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(local_addrs = ?self.local_addrs, "closing TCP server");
        for task in self.accept_tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        let unclaimed = self.backlog.drain().len();
        if unclaimed > 0 {
            debug!(unclaimed, "closing unclaimed TCP connections");
        }
        self.backlog_notify.notify_waiters();
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        self.close();
    }
}

/// `tcp://host:port`
pub struct TcpTransport;

#[async_trait]
impl TransportFactory for TcpTransport {
    fn connect(&self, ctx: &TransportContext, uri: &ConnectionUri, handler: Arc<dyn ConnectionHandler>, mode: ConnectionMode) -> anyhow::Result<Arc<dyn PersistentConnection>> {
        let uri = uri.clone();
        let max_receive_size = ctx.config.mtu;
        let connect = async move {
            let addr = uri.resolve().await?;
            TcpLink::connect(addr, max_receive_size).await
                .map_err(|e| anyhow!("connecting to {}: {}", uri, e))
        }.boxed();
        Ok(Connection::connecting("tcp", connect, handler, mode, &ctx.config, &ctx.pool, None))
    }

    async fn bind(&self, ctx: &TransportContext, uri: &ConnectionUri) -> anyhow::Result<Arc<dyn ConnectionListener>> {
        let addr = uri.resolve().await?;
        Ok(Arc::new(TcpServer::bind(addr, ctx.clone()).await?))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::time::timeout;
    use crate::buffers::buffer_pool::BufferPool;
    use crate::config::TransportConfig;
    use crate::connection::{ConnectionState, MockConnectionHandler};
    use super::*;

    fn context() -> TransportContext {
        TransportContext::new(TransportConfig {
            max_wait: Duration::from_millis(20),
            tcp_backlog: 2,
            ..Default::default()
        }).unwrap()
    }

    fn span(data: &[u8]) -> crate::buffers::pooled_buffer::BufferSpan {
        let mut buf = BufferPool::global().get_buffer(data.len());
        buf.spare_mut()[..data.len()].copy_from_slice(data);
        buf.commit(data.len());
        buf.freeze().full_span()
    }

    #[tokio::test]
    async fn test_client_sends_and_receives() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let received = Arc::new(Mutex::new(Vec::new()));
        let received_cloned = received.clone();
        let mut handler = MockConnectionHandler::new();
        handler.expect_on_receive()
            .returning(move |data| received_cloned.lock().unwrap().extend_from_slice(data));
        handler.expect_on_update().returning(|| None);
        handler.expect_on_close().times(1).return_const(());

        let uri = ConnectionUri::parse(&format!("tcp://{}", addr)).unwrap();
        let conn = TcpTransport.connect(&context(), &uri, Arc::new(handler), ConnectionMode::Threaded).unwrap();
        conn.send(span(b"hello").into()).unwrap();
        conn.start_connect().unwrap();

        let (mut peer, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 5];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        peer.write_all(b"back").await.unwrap();
        timeout(Duration::from_secs(5), async {
            while received.lock().unwrap().len() < 4 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }).await.unwrap();
        assert_eq!(*received.lock().unwrap(), b"back");

        drop(peer);
        timeout(Duration::from_secs(5), conn.closed()).await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_connect_refused_closes() {
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let mut handler = MockConnectionHandler::new();
        handler.expect_on_close().times(1).return_const(());

        let uri = ConnectionUri::parse(&format!("tcp://{}", addr)).unwrap();
        let conn = TcpTransport.connect(&context(), &uri, Arc::new(handler), ConnectionMode::Threaded).unwrap();
        conn.start_connect().unwrap();
        timeout(Duration::from_secs(5), conn.closed()).await.unwrap();
    }

    #[tokio::test]
    async fn test_server_accepts() {
        let server = TcpServer::bind("127.0.0.1:0".parse().unwrap(), context()).await.unwrap();
        let addr = server.local_addrs()[0];

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"abc").await.unwrap();

        let count = Arc::new(AtomicUsize::new(0));
        let count_cloned = count.clone();
        let mut handler = MockConnectionHandler::new();
        handler.expect_on_receive()
            .returning(move |data| { count_cloned.fetch_add(data.len(), Ordering::SeqCst); });
        handler.expect_on_update().returning(|| None);
        handler.expect_on_close().return_const(());

        let conn = timeout(Duration::from_secs(5), server.accept(Arc::new(handler), ConnectionMode::Threaded)).await.unwrap().unwrap();
        assert_eq!(conn.state(), ConnectionState::Created);
        conn.start_connect().unwrap();
        assert!(conn.is_alive());

        timeout(Duration::from_secs(5), async {
            while count.load(Ordering::SeqCst) < 3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }).await.unwrap();
        conn.dispose();
    }

    #[tokio::test]
    async fn test_close_wakes_accept() {
        let server = Arc::new(TcpServer::bind("127.0.0.1:0".parse().unwrap(), context()).await.unwrap());
        let server_cloned = server.clone();
        let accepting = tokio::spawn(async move {
            server_cloned.accept(Arc::new(MockConnectionHandler::new()), ConnectionMode::Threaded).await.is_err()
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        server.close();
        assert!(timeout(Duration::from_secs(1), accepting).await.unwrap().unwrap());
    }

    #[tokio::test]
    async fn test_wildcard_binds_same_port() {
        let server = TcpServer::bind("0.0.0.0:0".parse().unwrap(), context()).await.unwrap();
        let addrs = server.local_addrs();
        assert!(!addrs.is_empty());
        assert!(addrs.iter().all(|a| a.port() == addrs[0].port()));
        assert!(addrs.iter().any(|a| a.is_ipv4()));
    }
}
