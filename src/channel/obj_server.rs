use std::net::SocketAddr;
use std::sync::Arc;
use tracing::debug;
use crate::channel::obj_channel::ObjChannel;
use crate::channel::FrameSink;
use crate::codec::post_process::PostProcessChain;
use crate::codec::reader_writer::MessageCodec;
use crate::config::ChannelOptions;
use crate::connection::registry::{ConnectionUri, SchemeRegistry, TransportContext};
use crate::connection::ConnectionListener;

/// Accepts peers on a bound address, producing one `ObjChannel` per peer. The bind URI's query
///  options configure all accepted channels.
pub struct ObjServer<C: MessageCodec> {
    listener: Arc<dyn ConnectionListener>,
    context: TransportContext,
    codec: Arc<C>,
    post_process: PostProcessChain,
    options: ChannelOptions,
}

impl<C: MessageCodec> ObjServer<C> {
    pub async fn bind(registry: &SchemeRegistry, uri: &ConnectionUri, codec: Arc<C>) -> anyhow::Result<ObjServer<C>> {
        Self::bind_with(registry, uri, codec, PostProcessChain::default()).await
    }

    pub async fn bind_with(registry: &SchemeRegistry, uri: &ConnectionUri, codec: Arc<C>, post_process: PostProcessChain) -> anyhow::Result<ObjServer<C>> {
        let options = uri.channel_options()?;
        let listener = registry.bind(uri).await?;
        debug!(%uri, addrs = ?listener.local_addrs(), "channel server bound");

        Ok(ObjServer {
            listener,
            context: registry.context().clone(),
            codec,
            post_process,
            options,
        })
    }

    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listener.local_addrs()
    }

    pub fn options(&self) -> &ChannelOptions {
        &self.options
    }

    /// Waits for the next peer
    pub async fn accept(&self) -> anyhow::Result<ObjChannel<C>> {
        self.accept_with_sink(None).await
    }

    pub async fn accept_with_sink(&self, sink: Option<Arc<dyn FrameSink<C>>>) -> anyhow::Result<ObjChannel<C>> {
        let prepared = ObjChannel::prepare(&self.context, self.codec.clone(), self.post_process.clone(), self.options.clone(), sink);
        let connection = self.listener.accept(prepared.handler.clone(), prepared.mode()).await?;
        debug!(peer = ?connection.remote_addr(), "accepted channel");
        prepared.wire(connection)
    }

    /// Stops accepting peers. Channels accepted before stay open.
    pub fn close(&self) {
        self.listener.close();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;
    use rstest::rstest;
    use crate::codec::reader_writer::{RawCodec, RawMessage};
    use crate::config::TransportConfig;
    use super::*;

    #[rstest]
    #[case::tcp("tcp")]
    #[case::udp("udp")]
    #[case::kcpraw("kcpraw")]
    #[case::kcp("kcp")]
    #[tokio::test]
    async fn test_ping_pong(#[case] scheme: &str) {
        let registry = SchemeRegistry::with_defaults(TransportConfig::default()).unwrap();
        let path = if scheme == "kcpraw" { "/7" } else { "" };
        let server = ObjServer::bind(&registry, &format!("{}://127.0.0.1:0{}", scheme, path).parse().unwrap(), Arc::new(RawCodec)).await.unwrap();
        let port = server.local_addrs()[0].port();

        let client = ObjChannel::connect(&registry, &format!("{}://127.0.0.1:{}{}", scheme, port, path).parse().unwrap(), Arc::new(RawCodec)).unwrap();
        // UDP based servers only see a peer once it sent something
        client.write(RawMessage::new(5, "ping")).unwrap();

        let accepted = tokio::time::timeout(Duration::from_secs(5), server.accept()).await.unwrap().unwrap();
        let ping = accepted.read(Duration::from_secs(5)).await.unwrap();
        assert_eq!(ping.message.unwrap(), RawMessage::new(5, "ping"));

        accepted.write_response(RawMessage::new(5, "pong"), ping.seq).unwrap();
        let pong = client.read(Duration::from_secs(5)).await.unwrap();
        assert_eq!(pong.sseq, ping.seq);
        assert_eq!(pong.message.unwrap().payload.as_ref(), b"pong");

        server.close();
        client.dispose();
        accepted.dispose();
    }

    async fn udp_server(registry: &SchemeRegistry) -> (ObjServer<RawCodec>, u16) {
        let server = ObjServer::bind(registry, &"udp://127.0.0.1:0".parse().unwrap(), Arc::new(RawCodec)).await.unwrap();
        let port = server.local_addrs()[0].port();
        (server, port)
    }

    #[tokio::test]
    async fn test_udp_first_datagram_arrives() {
        let registry = SchemeRegistry::with_defaults(TransportConfig::default()).unwrap();

        // a unicast UDP server has a single connection, so every round starts from scratch
        for i in 0..5u8 {
            let (server, port) = udp_server(&registry).await;
            let client = ObjChannel::connect(&registry, &format!("udp://127.0.0.1:{}", port).parse().unwrap(), Arc::new(RawCodec)).unwrap();
            client.write(RawMessage::new(3, vec![i])).unwrap();

            let accepted = tokio::time::timeout(Duration::from_secs(5), server.accept()).await.unwrap().unwrap();
            let received = accepted.read(Duration::from_secs(5)).await.unwrap();
            assert_eq!(received.message.unwrap(), RawMessage::new(3, vec![i]));
            client.dispose();
            accepted.dispose();
            server.close();
        }
    }

    #[tokio::test]
    async fn test_udp_oversized_message_keeps_channels_alive() {
        let registry = SchemeRegistry::with_defaults(TransportConfig::default()).unwrap();
        let (server, port) = udp_server(&registry).await;

        let client = ObjChannel::connect(&registry, &format!("udp://127.0.0.1:{}", port).parse().unwrap(), Arc::new(RawCodec)).unwrap();
        client.write(RawMessage::new(5, "hello")).unwrap();
        let accepted = tokio::time::timeout(Duration::from_secs(5), server.accept()).await.unwrap().unwrap();
        assert_eq!(accepted.read(Duration::from_secs(5)).await.unwrap().message.unwrap(), RawMessage::new(5, "hello"));

        client.write(RawMessage::new(5, vec![7u8; 70_000])).unwrap();
        client.write(RawMessage::new(5, "after")).unwrap();
        let after = accepted.read(Duration::from_secs(5)).await.unwrap();
        assert_eq!(after.message.unwrap(), RawMessage::new(5, "after"));

        accepted.write(RawMessage::new(5, vec![7u8; 70_000])).unwrap();
        accepted.write(RawMessage::new(5, "back")).unwrap();
        let back = client.read(Duration::from_secs(5)).await.unwrap();
        assert_eq!(back.message.unwrap(), RawMessage::new(5, "back"));

        assert!(client.is_alive());
        assert!(accepted.is_alive());
        server.close();
        client.dispose();
        accepted.dispose();
    }
}
