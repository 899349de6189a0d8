use std::net::SocketAddr;
use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;
use crate::channel::ObjChannel;
use crate::codec::post_process::PostProcessChain;
use crate::codec::reader_writer::MessageCodec;
use crate::config::RequestConfig;
use crate::connection::registry::{ConnectionUri, SchemeRegistry};
use crate::request::correlation::RequestCore;
use crate::request::handlers::HandlerRegistry;
use crate::request::{RequestError, RequestResult};

/// Sends requests over a channel and awaits their responses. It also serves the peer's requests
///  with its own handlers, so the accepted end of a `ReqServer` is a `ReqClient` as well.
pub struct ReqClient<C: MessageCodec> {
    channel: ObjChannel<C>,
    core: Arc<RequestCore<C>>,
}

impl<C: MessageCodec> Clone for ReqClient<C> {
    fn clone(&self) -> Self {
        ReqClient {
            channel: self.channel.clone(),
            core: self.core.clone(),
        }
    }
}

impl<C: MessageCodec> ReqClient<C> {
    pub fn connect(registry: &SchemeRegistry, uri: &ConnectionUri, codec: Arc<C>) -> anyhow::Result<ReqClient<C>> {
        Self::connect_with(registry, uri, codec, PostProcessChain::default(), RequestConfig::default())
    }

    /// The URI's `requesttimeout` and `maxoutstanding` options override `config`
    pub fn connect_with(
        registry: &SchemeRegistry,
        uri: &ConnectionUri,
        codec: Arc<C>,
        post_process: PostProcessChain,
        config: RequestConfig,
    ) -> anyhow::Result<ReqClient<C>> {
        let config = config.with_channel_options(&uri.channel_options()?);
        config.validate()?;

        let core = Arc::new(RequestCore::new(config, Default::default()));
        let channel = ObjChannel::connect_with(registry, uri, codec, post_process, Some(core.clone()))?;
        Ok(ReqClient { channel, core })
    }

    pub(super) fn from_parts(channel: ObjChannel<C>, core: Arc<RequestCore<C>>) -> ReqClient<C> {
        ReqClient { channel, core }
    }

    pub fn channel(&self) -> &ObjChannel<C> {
        &self.channel
    }

    /// Handlers for messages the peer sends on its own
    pub fn handlers(&self) -> &Arc<HandlerRegistry<C::Message>> {
        self.core.handlers()
    }

    /// Number of requests waiting for a response
    pub fn outstanding(&self) -> usize {
        self.core.outstanding()
    }

    pub fn is_alive(&self) -> bool {
        self.channel.is_alive()
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.channel.remote_addr()
    }

    pub async fn request(&self, msg: C::Message) -> RequestResult<C::Message> {
        self.request_with_timeout(msg, self.core.config().default_timeout).await
    }

    pub async fn request_with_timeout(&self, msg: C::Message, timeout: Duration) -> RequestResult<C::Message> {
        let mut registered = None;
        let sent = self.channel.send_message(msg, 0, |seq| {
            registered = Some((seq, self.core.register(seq, timeout)));
        });

        let (seq, mut receiver) = match (sent, registered) {
            (Ok(_), Some(registered)) => registered,
            (Err(e), registered) => {
                if let Some((seq, _)) = registered {
                    self.core.cancel(seq);
                }
                return Err(RequestError::SendFailed(e.to_string()));
            }
            (Ok(seq), None) => return Err(RequestError::SendFailed(format!("request {} was not registered", seq))),
        };
        trace!(seq, ?timeout, "sent request");

        let polled = !self.channel.options().deserialize_in_connection_thread;
        let deadline = Instant::now() + timeout;
        loop {
            let mut frames = pin!(self.channel.frames_notify().notified());
            frames.as_mut().enable();
            if polled {
                self.channel.pump();
            }

            tokio::select! {
                biased;
                result = &mut receiver => return result.unwrap_or(Err(RequestError::ConnectionClosed)),
                _ = frames, if polled => {}
                _ = tokio::time::sleep_until(deadline) => {
                    // fails this request, so the receiver is ready in the next iteration
                    self.core.check_timeouts();
                }
            }
        }
    }

    /// Sends a message that expects no response, returning its sequence number
    pub fn send_oneway(&self, msg: C::Message) -> anyhow::Result<u32> {
        self.channel.write(msg)
    }

    /// Processes received frames in the calling task. This is only needed if the channel does not
    ///  decode frames on the connection task and no request is being awaited.
    pub fn pump(&self) -> usize {
        self.channel.pump()
    }

    /// Closes the channel, failing all outstanding requests with `ConnectionClosed`
    pub fn dispose(&self) {
        self.channel.dispose();
    }

    pub async fn closed(&self) {
        self.channel.closed().await
    }
}

#[cfg(test)]
mod tests {
    use futures::future::join_all;
    use futures::FutureExt;
    use tokio::task::JoinHandle;
    use crate::channel::obj_channel::tests::{memory_channel, transfer};
    use crate::channel::FrameSink;
    use crate::codec::reader_writer::{RawCodec, RawMessage};
    use crate::config::ChannelOptions;
    use crate::connection::driver::tests::MemoryLink;
    use crate::request::HandlerReply;
    use super::*;

    fn endpoint(options: ChannelOptions, config: RequestConfig) -> (ReqClient<RawCodec>, MemoryLink) {
        let core = Arc::new(RequestCore::new(config, Default::default()));
        let (channel, link) = memory_channel(RawCodec, options, Some(core.clone() as Arc<dyn FrameSink<RawCodec>>));
        (ReqClient::from_parts(channel, core), link)
    }

    fn connect_links(a: MemoryLink, b: MemoryLink) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                transfer(&a, &b);
                transfer(&b, &a);
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
    }

    fn pong_server(options: ChannelOptions) -> (ReqClient<RawCodec>, MemoryLink) {
        let (server, link) = endpoint(options, RequestConfig::default());
        server.handlers().register(5, |request: crate::request::IncomingRequest<RawMessage>| {
            assert_eq!(request.message.payload.as_ref(), b"ping");
            HandlerReply::Reply(RawMessage::new(5, "pong"))
        });
        server.handlers().register(6, |_: crate::request::IncomingRequest<RawMessage>| {
            HandlerReply::Later(async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Some(RawMessage::new(6, "later"))
            }.boxed())
        });
        (server, link)
    }

    #[tokio::test]
    async fn test_ping_pong() {
        let (client, client_link) = endpoint(ChannelOptions::default(), RequestConfig::default());
        let (_server, server_link) = pong_server(ChannelOptions::default());
        let wire = connect_links(client_link, server_link);

        let response = client.request(RawMessage::new(5, "ping")).await.unwrap();
        assert_eq!(response.message, RawMessage::new(5, "pong"));
        assert_eq!(response.sseq, 1);
        assert!(response.rtt() < Duration::from_secs(10));
        assert_eq!(client.outstanding(), 0);

        let later = client.request(RawMessage::new(6, "")).await.unwrap();
        assert_eq!(later.message.payload.as_ref(), b"later");
        wire.abort();
    }

    #[tokio::test]
    async fn test_polled_client() {
        let options = ChannelOptions {
            deserialize_in_connection_thread: false,
            ..Default::default()
        };
        let (client, client_link) = endpoint(options, RequestConfig::default());
        let (_server, server_link) = pong_server(ChannelOptions::default());
        let wire = connect_links(client_link, server_link);

        let response = client.request(RawMessage::new(5, "ping")).await.unwrap();
        assert_eq!(response.message.payload.as_ref(), b"pong");
        wire.abort();
    }

    #[tokio::test]
    async fn test_responses_in_reverse_order() {
        let (client, client_link) = endpoint(ChannelOptions::default(), RequestConfig::default());
        let (server, server_link) = memory_channel(RawCodec, ChannelOptions::default(), None);
        let wire = connect_links(client_link, server_link);

        let requests = (0..8u8)
            .map(|i| client.request(RawMessage::new(1, vec![i])));
        let responder = async {
            let mut received = Vec::new();
            for _ in 0..8 {
                let frame = server.read(Duration::from_secs(5)).await.unwrap();
                received.push((frame.seq, frame.message.unwrap().payload));
            }
            for (seq, payload) in received.into_iter().rev() {
                server.write_response(RawMessage::new(2, payload), seq).unwrap();
            }
        };

        let (responses, _) = tokio::join!(join_all(requests), responder);
        for (i, response) in responses.into_iter().enumerate() {
            let response = response.unwrap();
            assert_eq!(response.message.payload.as_ref(), &[i as u8]);
            assert_eq!(response.sseq, i as u32 + 1);
        }
        wire.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_exceeding_capacity() {
        let config = RequestConfig {
            capacity: 2,
            default_timeout: Duration::from_millis(100),
            ..Default::default()
        };
        let (client, _link) = endpoint(ChannelOptions::default(), config);

        let results = join_all((0..3u8).map(|i| client.request(RawMessage::new(1, vec![i])))).await;
        assert_eq!(results[0].as_ref().unwrap_err(), &RequestError::TooManyOutstanding);
        assert_eq!(results[1].as_ref().unwrap_err(), &RequestError::Timeout);
        assert_eq!(results[2].as_ref().unwrap_err(), &RequestError::Timeout);
        assert_eq!(client.outstanding(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_without_traffic() {
        let (client, _link) = endpoint(ChannelOptions::default(), RequestConfig::default());
        let start = Instant::now();
        let result = client.request_with_timeout(RawMessage::new(1, "x"), Duration::from_millis(250)).await;

        assert!(result.unwrap_err().is_timeout());
        assert!(start.elapsed() >= Duration::from_millis(250));
        assert!(client.is_alive());
    }

    #[tokio::test]
    async fn test_deferred_serialization_failure_fails_request() {
        let options = ChannelOptions {
            serialize_in_connection_thread: true,
            ..Default::default()
        };
        let (client, _link) = endpoint(options, RequestConfig::default());

        let start = Instant::now();
        // type 0 is reserved, so composing fails on the connection task
        let result = client.request_with_timeout(RawMessage::new(0, "x"), Duration::from_secs(30)).await;
        assert!(matches!(result, Err(RequestError::SendFailed(_))), "{:?}", result.map(|r| r.message));
        assert!(start.elapsed() < Duration::from_secs(30));
        assert_eq!(client.outstanding(), 0);
        assert!(client.is_alive());
    }

    #[tokio::test]
    async fn test_dispose_fails_outstanding() {
        let (client, _link) = endpoint(ChannelOptions::default(), RequestConfig::default());
        let pending = tokio::spawn({
            let client = client.clone();
            async move { client.request(RawMessage::new(1, "x")).await }
        });
        while client.outstanding() == 0 {
            tokio::task::yield_now().await;
        }

        client.dispose();
        assert_eq!(pending.await.unwrap().unwrap_err(), RequestError::ConnectionClosed);

        client.closed().await;
        assert!(matches!(client.request(RawMessage::new(1, "y")).await, Err(RequestError::SendFailed(_))));
        assert_eq!(client.outstanding(), 0);
    }
}
