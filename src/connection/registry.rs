use std::fmt::{Display, Formatter};
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::{Arc, OnceLock, RwLock};
use anyhow::{anyhow, bail};
use async_trait::async_trait;
use rustc_hash::FxHashMap;
use tracing::debug;
use crate::buffers::buffer_pool::BufferPool;
use crate::config::{ChannelOptions, TransportConfig};
use crate::connection::kcp::{KcpConsultTransport, KcpRawTransport};
use crate::connection::tcp::TcpTransport;
use crate::connection::udp::UdpTransport;
use crate::connection::{ConnectionHandler, ConnectionListener, ConnectionMode, PersistentConnection};

/// A parsed connection URI: `scheme://host:port[/path][?key=value&flag...]`.
///
/// Option keys are case-insensitive and stored in lower case. A key without a value is a flag
///  with the value `"true"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionUri {
    pub scheme: String,
    pub host: String,
    pub port: u16,
    /// the path without its leading '/'
    pub path: String,
    pub options: FxHashMap<String, String>,
}

impl FromStr for ConnectionUri {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (scheme, rest) = s.split_once("://")
            .ok_or_else(|| anyhow!("URI without scheme: {}", s))?;
        if scheme.is_empty() {
            bail!("URI without scheme: {}", s);
        }

        let (rest, query) = match rest.split_once('?') {
            Some((r, q)) => (r, Some(q)),
            None => (rest, None),
        };
        let (authority, path) = match rest.split_once('/') {
            Some((a, p)) => (a, p),
            None => (rest, ""),
        };

        let (host, port) = if let Some(bracketed) = authority.strip_prefix('[') {
            let (host, after) = bracketed.split_once(']')
                .ok_or_else(|| anyhow!("unterminated IPV6 address in {}", s))?;
            let port = after.strip_prefix(':')
                .ok_or_else(|| anyhow!("URI without port: {}", s))?;
            (host, port)
        }
        else {
            authority.rsplit_once(':')
                .ok_or_else(|| anyhow!("URI without port: {}", s))?
        };
        if host.is_empty() {
            bail!("URI without host: {}", s);
        }
        let port = port.parse::<u16>()
            .map_err(|e| anyhow!("invalid port in {}: {}", s, e))?;

        let mut options = FxHashMap::default();
        for pair in query.unwrap_or("").split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, "true"));
            options.insert(key.to_ascii_lowercase(), value.to_string());
        }

        Ok(ConnectionUri {
            scheme: scheme.to_ascii_lowercase(),
            host: host.to_string(),
            port,
            path: path.to_string(),
            options,
        })
    }
}

impl Display for ConnectionUri {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.host.contains(':') {
            write!(f, "{}://[{}]:{}", self.scheme, self.host, self.port)?;
        }
        else {
            write!(f, "{}://{}:{}", self.scheme, self.host, self.port)?;
        }
        if !self.path.is_empty() {
            write!(f, "/{}", self.path)?;
        }

        let mut keys = self.options.keys().collect::<Vec<_>>();
        keys.sort();
        for (i, key) in keys.into_iter().enumerate() {
            let separator = if i == 0 { '?' } else { '&' };
            write!(f, "{}{}={}", separator, key, self.options[key])?;
        }
        Ok(())
    }
}

impl ConnectionUri {
    pub fn parse(s: &str) -> anyhow::Result<ConnectionUri> {
        s.parse()
    }

    pub fn option(&self, key: &str) -> Option<&str> {
        self.options.get(&key.to_ascii_lowercase()).map(|s| s.as_str())
    }

    pub fn channel_options(&self) -> anyhow::Result<ChannelOptions> {
        ChannelOptions::from_options(&self.options)
    }

    /// Resolves host and port to a socket address, preferring IPV4 results
    pub async fn resolve(&self) -> anyhow::Result<SocketAddr> {
        let addrs = tokio::net::lookup_host((self.host.as_str(), self.port)).await?
            .collect::<Vec<_>>();
        addrs.iter()
            .find(|a| a.is_ipv4())
            .or(addrs.first())
            .copied()
            .ok_or_else(|| anyhow!("{} does not resolve to an address", self.host))
    }
}

/// What every transport needs from its environment
#[derive(Clone)]
pub struct TransportContext {
    pub config: Arc<TransportConfig>,
    pub pool: Arc<BufferPool>,
}

impl TransportContext {
    pub fn new(config: TransportConfig) -> anyhow::Result<TransportContext> {
        config.validate()?;
        let pool = BufferPool::from_config(&config);
        Ok(TransportContext {
            config: Arc::new(config),
            pool,
        })
    }
}

/// Creates client connections and server listeners for a URI scheme
#[async_trait]
pub trait TransportFactory: Send + Sync + 'static {
    /// Creates an unstarted client connection
    fn connect(&self, ctx: &TransportContext, uri: &ConnectionUri, handler: Arc<dyn ConnectionHandler>, mode: ConnectionMode) -> anyhow::Result<Arc<dyn PersistentConnection>>;

    async fn bind(&self, ctx: &TransportContext, uri: &ConnectionUri) -> anyhow::Result<Arc<dyn ConnectionListener>>;
}

/// Maps URI schemes to transports
pub struct SchemeRegistry {
    context: TransportContext,
    factories: RwLock<FxHashMap<String, Arc<dyn TransportFactory>>>,
}

impl SchemeRegistry {
    pub fn new(config: TransportConfig) -> anyhow::Result<SchemeRegistry> {
        Ok(SchemeRegistry {
            context: TransportContext::new(config)?,
            factories: Default::default(),
        })
    }

    /// A registry with `tcp`, `udp`, `kcpraw` and `kcp`
    pub fn with_defaults(config: TransportConfig) -> anyhow::Result<SchemeRegistry> {
        let registry = SchemeRegistry::new(config)?;
        registry.register("tcp", Arc::new(TcpTransport));
        registry.register("udp", Arc::new(UdpTransport));
        registry.register("kcpraw", Arc::new(KcpRawTransport));
        registry.register("kcp", Arc::new(KcpConsultTransport));
        Ok(registry)
    }

    pub fn register(&self, scheme: &str, factory: Arc<dyn TransportFactory>) {
        let scheme = scheme.to_ascii_lowercase();
        debug!(scheme, "registering transport");
        self.factories.write().unwrap().insert(scheme, factory);
    }

    pub fn context(&self) -> &TransportContext {
        &self.context
    }

    fn factory(&self, uri: &ConnectionUri) -> anyhow::Result<Arc<dyn TransportFactory>> {
        self.factories.read().unwrap()
            .get(&uri.scheme)
            .cloned()
            .ok_or_else(|| anyhow!("no transport registered for scheme {}", uri.scheme))
    }

    pub fn connect(&self, uri: &ConnectionUri, handler: Arc<dyn ConnectionHandler>, mode: ConnectionMode) -> anyhow::Result<Arc<dyn PersistentConnection>> {
        self.factory(uri)?
            .connect(&self.context, uri, handler, mode)
    }

    pub async fn bind(&self, uri: &ConnectionUri) -> anyhow::Result<Arc<dyn ConnectionListener>> {
        self.factory(uri)?
            .bind(&self.context, uri)
            .await
    }
}

/// A process-wide registry with the default transports and configuration
pub fn default_registry() -> Arc<SchemeRegistry> {
    static DEFAULT: OnceLock<Arc<SchemeRegistry>> = OnceLock::new();
    DEFAULT.get_or_init(|| {
        Arc::new(SchemeRegistry::with_defaults(TransportConfig::default())
            .expect("default transport configuration should be valid"))
    })
        .clone()
}
