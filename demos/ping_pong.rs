use std::sync::Arc;
use std::time::Duration;
use anyhow::bail;
use clap::Parser;
use clap_derive::Parser;
use pulsenet::codec::reader_writer::{RawCodec, RawMessage};
use pulsenet::connection::registry::{default_registry, ConnectionUri};
use pulsenet::request::{HandlerReply, IncomingRequest, ReqClient, ReqServer};
use tracing::{info, warn, Level};

const PING: u32 = 5;

/// Answers pings on a URI, or sends pings to it, e.g.
///
///   ping_pong server 'kcp://0.0.0.0:9000'
///   ping_pong client 'kcp://127.0.0.1:9000?requesttimeout=2000' --count 10
#[derive(Parser)]
struct Args {
    /// 'server' or 'client'
    role: String,
    uri: String,

    #[clap(long, default_value_t = 5)]
    count: usize,

    #[clap(long, default_value_t = 1000)]
    interval_millis: u64,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(if args.verbose { Level::DEBUG } else { Level::INFO })
        .try_init()
        .ok();

    let uri: ConnectionUri = args.uri.parse()?;
    match args.role.as_str() {
        "server" => serve(&uri).await,
        "client" => ping(&uri, args.count, Duration::from_millis(args.interval_millis)).await,
        other => bail!("unknown role {}, expected 'server' or 'client'", other),
    }
}

async fn serve(uri: &ConnectionUri) -> anyhow::Result<()> {
    let server = ReqServer::bind(&default_registry(), uri, Arc::new(RawCodec)).await?;
    server.handlers().register(PING, |request: IncomingRequest<RawMessage>| {
        info!(seq = request.seq, "ping");
        HandlerReply::Reply(RawMessage::new(PING, "pong"))
    });
    info!("listening on {:?}", server.local_addrs());
    server.serve().await
}

async fn ping(uri: &ConnectionUri, count: usize, interval: Duration) -> anyhow::Result<()> {
    let client = ReqClient::connect(&default_registry(), uri, Arc::new(RawCodec))?;
    for _ in 0..count {
        match client.request(RawMessage::new(PING, "ping")).await {
            Ok(response) => info!(rtt = ?response.rtt(), "{}", String::from_utf8_lossy(&response.message.payload)),
            Err(e) => warn!("ping failed: {}", e),
        }
        tokio::time::sleep(interval).await;
    }
    client.dispose();
    Ok(())
}
