use std::time::Duration;
use anyhow::bail;
use rustc_hash::FxHashMap;

/// Transport-level settings shared by all connections created through a registry. These are
///  local tuning values, nothing here is negotiated with the peer.
#[derive(Clone, Debug)]
pub struct TransportConfig {
    /// This is the payload size that is assumed to fit into a single datagram without IP level
    ///  fragmentation. It is also the size of the 'regular' pooled buffers, which makes it the
    ///  most important sizing parameter for memory use.
    ///
    /// With full Ethernet frames and no optional IP headers, UDP payload is `1500 - 20 - 8 = 1472`
    ///  for IPV4 and `1500 - 40 - 8 = 1452` for IPV6. The default leaves some headroom for
    ///  tunnels and VPNs.
    pub mtu: usize,

    /// Upper bound for an envelope's payload. Bigger messages are rejected when composing and
    ///  skipped (with an error frame) when received.
    pub max_message_size: usize,

    /// Upper bound for any wait inside a connection task. A connection notices disposal at the
    ///  latest after this interval.
    pub max_wait: Duration,

    /// number of MTU sized buffers kept in the pool
    pub pool_mtu_capacity: usize,
    /// number of larger size classes (MTU * 2^level)
    pub pool_levels: usize,
    /// number of buffers kept per larger size class
    pub pool_level_capacity: usize,

    /// accepted-but-unclaimed TCP connections and KCP conversations; excess peers are rejected
    ///  right away
    pub tcp_backlog: usize,

    /// number of remote addresses remembered per local interface by broadcast UDP servers
    pub udp_recent_remotes: usize,

    pub kcp: KcpTuning,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            mtu: 1400,
            max_message_size: 256 * 1024,
            max_wait: Duration::from_millis(100),
            pool_mtu_capacity: 4096,
            pool_levels: 6,
            pool_level_capacity: 16,
            tcp_backlog: 16,
            udp_recent_remotes: 32,
            kcp: KcpTuning::default(),
        }
    }
}

impl TransportConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.mtu < 100 {
            bail!("MTU is too small: {}", self.mtu);
        }
        if self.mtu > 65_507 {
            bail!("MTU {} does not fit into a UDP datagram", self.mtu);
        }
        if self.max_message_size == 0 || self.max_message_size > u32::MAX as usize {
            bail!("max message size must be in 1..=u32::MAX, was {}", self.max_message_size);
        }
        if self.max_wait.is_zero() {
            bail!("max wait must be positive");
        }
        if self.pool_mtu_capacity == 0 {
            bail!("buffer pool needs room for at least one MTU sized buffer");
        }
        if self.tcp_backlog == 0 || self.udp_recent_remotes == 0 {
            bail!("backlog sizes must be positive");
        }
        self.kcp.validate(self.mtu)
    }
}

/// ARQ tuning for KCP connections. The defaults are the 'fast' profile: no-delay mode with a
///  10ms internal tick, fast retransmit after 2 skipped acks and no congestion window.
#[derive(Clone, Debug)]
pub struct KcpTuning {
    pub nodelay: bool,
    pub interval_ms: i32,
    pub resend: i32,
    pub no_congestion_control: bool,
    pub send_window: u16,
    pub recv_window: u16,
    /// upper bound for the time between two ARQ updates
    pub update_interval: Duration,
    /// give up on a handshake that is not answered within this time
    pub consult_timeout: Duration,
}

impl Default for KcpTuning {
    fn default() -> Self {
        KcpTuning {
            nodelay: true,
            interval_ms: 10,
            resend: 2,
            no_congestion_control: true,
            send_window: 128,
            recv_window: 128,
            update_interval: Duration::from_millis(10),
            consult_timeout: Duration::from_secs(10),
        }
    }
}

impl KcpTuning {
    /// KCP's per-segment header
    pub const SEGMENT_OVERHEAD: usize = 24;

    fn validate(&self, mtu: usize) -> anyhow::Result<()> {
        if mtu <= Self::SEGMENT_OVERHEAD {
            bail!("MTU {} leaves no room for KCP segments", mtu);
        }
        if self.send_window == 0 || self.recv_window == 0 {
            bail!("KCP windows must be positive");
        }
        if self.update_interval.is_zero() {
            bail!("KCP update interval must be positive");
        }
        Ok(())
    }
}

/// Per-channel options, usually parsed from a connection URI's query string.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelOptions {
    /// decode frames (and run request matching and handlers) on the connection task rather than
    ///  in a polling consumer
    pub deserialize_in_connection_thread: bool,
    /// defer serialization of outgoing messages to the connection task
    pub serialize_in_connection_thread: bool,
    /// dispose the channel if nothing was received for this long
    pub idle_timeout: Option<Duration>,
    /// do not start connecting before the first write or an explicit `start()`
    pub delay_start: bool,
    /// cooperative mode: the host calls `step()` instead of running a connection task
    pub positive: bool,
    pub request_timeout: Option<Duration>,
    pub max_outstanding: Option<usize>,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        ChannelOptions {
            deserialize_in_connection_thread: true,
            serialize_in_connection_thread: false,
            idle_timeout: None,
            delay_start: false,
            positive: false,
            request_timeout: None,
            max_outstanding: None,
        }
    }
}

impl ChannelOptions {
    /// Keys are expected in lower case (see `ConnectionUri`), values of bare flags are `"true"`.
    pub fn from_options(options: &FxHashMap<String, String>) -> anyhow::Result<ChannelOptions> {
        let defaults = ChannelOptions::default();

        Ok(ChannelOptions {
            deserialize_in_connection_thread: flag(options, "deserializeinconnectionthread")?
                .unwrap_or(defaults.deserialize_in_connection_thread),
            serialize_in_connection_thread: flag(options, "serializeinconnectionthread")?
                .unwrap_or(defaults.serialize_in_connection_thread),
            idle_timeout: millis(options, "idletimeout")?,
            delay_start: flag(options, "delaystart")?.unwrap_or(defaults.delay_start),
            positive: flag(options, "positive")?.unwrap_or(defaults.positive),
            request_timeout: millis(options, "requesttimeout")?,
            max_outstanding: match options.get("maxoutstanding") {
                None => None,
                Some(raw) => Some(raw.parse()?),
            },
        })
    }
}

fn flag(options: &FxHashMap<String, String>, key: &str) -> anyhow::Result<Option<bool>> {
    match options.get(key).map(|v| v.to_ascii_lowercase()) {
        None => Ok(None),
        Some(v) => match v.as_str() {
            "" | "true" | "1" | "yes" | "on" => Ok(Some(true)),
            "false" | "0" | "no" | "off" => Ok(Some(false)),
            _ => bail!("option {} expects a boolean, was {}", key, v),
        },
    }
}

fn millis(options: &FxHashMap<String, String>, key: &str) -> anyhow::Result<Option<Duration>> {
    match options.get(key) {
        None => Ok(None),
        Some(raw) => {
            let ms: u64 = raw.parse()
                .map_err(|e| anyhow::anyhow!("option {} expects milliseconds, was {}: {}", key, raw, e))?;
            if ms == 0 {
                Ok(None)
            }
            else {
                Ok(Some(Duration::from_millis(ms)))
            }
        }
    }
}

/// Settings for request / response correlation.
#[derive(Clone, Debug)]
pub struct RequestConfig {
    pub default_timeout: Duration,
    /// size of the ring of in-flight requests
    pub capacity: usize,
    /// Treat pending requests as timed out as soon as a response to a *newer* request arrives.
    ///
    /// This assumes that a peer answers in order, which holds for a single-threaded peer on a
    ///  reliable, ordered transport. It does not hold for UDP, or for peers answering
    ///  asynchronously, so it is off by default.
    pub evict_older_on_response: bool,
}

impl Default for RequestConfig {
    fn default() -> Self {
        RequestConfig {
            default_timeout: Duration::from_secs(10),
            capacity: 64,
            evict_older_on_response: false,
        }
    }
}

impl RequestConfig {
    pub fn with_channel_options(mut self, options: &ChannelOptions) -> RequestConfig {
        if let Some(timeout) = options.request_timeout {
            self.default_timeout = timeout;
        }
        if let Some(capacity) = options.max_outstanding {
            self.capacity = capacity;
        }
        self
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.capacity == 0 {
            bail!("request capacity must be positive");
        }
        if self.capacity > u32::MAX as usize / 2 {
            bail!("request capacity {} exceeds half the sequence number space", self.capacity);
        }
        Ok(())
    }
}
