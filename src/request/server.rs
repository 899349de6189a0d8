use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};
use crate::channel::ObjServer;
use crate::codec::post_process::PostProcessChain;
use crate::codec::reader_writer::MessageCodec;
use crate::config::RequestConfig;
use crate::connection::registry::{ConnectionUri, SchemeRegistry};
use crate::connection::ConnectionState;
use crate::request::client::ReqClient;
use crate::request::correlation::RequestCore;
use crate::request::handlers::HandlerRegistry;

/// Accepts peers and answers their requests with a set of handlers shared by all peers
pub struct ReqServer<C: MessageCodec> {
    server: ObjServer<C>,
    handlers: Arc<HandlerRegistry<C::Message>>,
    config: RequestConfig,
    peers: Mutex<Vec<ReqClient<C>>>,
}

impl<C: MessageCodec> ReqServer<C> {
    pub async fn bind(registry: &SchemeRegistry, uri: &ConnectionUri, codec: Arc<C>) -> anyhow::Result<ReqServer<C>> {
        Self::bind_with(registry, uri, codec, PostProcessChain::default(), RequestConfig::default()).await
    }

    pub async fn bind_with(
        registry: &SchemeRegistry,
        uri: &ConnectionUri,
        codec: Arc<C>,
        post_process: PostProcessChain,
        config: RequestConfig,
    ) -> anyhow::Result<ReqServer<C>> {
        let config = config.with_channel_options(&uri.channel_options()?);
        config.validate()?;

        Ok(ReqServer {
            server: ObjServer::bind_with(registry, uri, codec, post_process).await?,
            handlers: Default::default(),
            config,
            peers: Default::default(),
        })
    }

    pub fn handlers(&self) -> &Arc<HandlerRegistry<C::Message>> {
        &self.handlers
    }

    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.server.local_addrs()
    }

    /// Waits for the next peer. The returned endpoint uses the server's handlers, and it can send
    ///  requests to the peer.
    pub async fn accept(&self) -> anyhow::Result<ReqClient<C>> {
        let core = Arc::new(RequestCore::new(self.config.clone(), self.handlers.clone()));
        let channel = self.server.accept_with_sink(Some(core.clone())).await?;
        Ok(ReqClient::from_parts(channel, core))
    }

    /// Accepts peers and keeps them open until they close or the server is closed. Returns the
    ///  error that ended accepting, e.g. because `close()` was called.
    pub async fn serve(&self) -> anyhow::Result<()> {
        loop {
            let peer = match self.accept().await {
                Ok(peer) => peer,
                Err(e) => {
                    debug!("stopped serving: {}", e);
                    return Err(e);
                }
            };
            info!(peer = ?peer.remote_addr(), "serving peer");

            let mut peers = self.peers.lock().unwrap();
            peers.retain(|p| p.channel().state() != ConnectionState::Closed);
            peers.push(peer);
        }
    }

    /// Number of peers kept open by `serve()`
    pub fn num_peers(&self) -> usize {
        let mut peers = self.peers.lock().unwrap();
        peers.retain(|p| p.channel().state() != ConnectionState::Closed);
        peers.len()
    }

    /// Stops accepting and disposes the peers kept open by `serve()`
    pub fn close(&self) {
        self.server.close();
        for peer in std::mem::take(&mut *self.peers.lock().unwrap()) {
            peer.dispose();
        }
    }
}
