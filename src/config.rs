use anyhow::bail;
use crate::compression::CompressionType;
use crate::ripc::RipcVersion;

pub const MAX_FLUSH_ORDER_LEN: usize = 32;

/// Settings shared by client and server channels
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Number of output blocks reserved for the channel. Each block holds up to one frame.
    pub guaranteed_output_buffers: usize,
    /// Upper bound for blocks in use, including blocks borrowed from the shared pool. Only server
    ///  channels borrow blocks.
    pub max_output_buffers: usize,

    /// Number of queued bytes that triggers a flush as part of a write
    pub high_water_mark: usize,

    /// The sequence in which the priority queues are drained during a flush, e.g. "HMHLHM". It
    ///  must contain at least one 'H' and one 'M'.
    pub flush_order: String,

    /// For a client, this is the compression it asks for. For a server, this is the compression
    ///  it uses if the client supports it.
    pub compression_type: CompressionType,
    pub compression_level: u8,
    /// `None` for the algorithm's minimum
    pub compression_threshold: Option<usize>,

    /// `None` leaves the OS default
    pub sys_send_buffer_size: Option<usize>,
    pub sys_recv_buffer_size: Option<usize>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        ChannelConfig {
            guaranteed_output_buffers: 50,
            max_output_buffers: 50,
            high_water_mark: 6144,
            flush_order: "HMHLHM".to_string(),
            compression_type: CompressionType::None,
            compression_level: 6,
            compression_threshold: None,
            sys_send_buffer_size: None,
            sys_recv_buffer_size: None,
        }
    }
}

impl ChannelConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.guaranteed_output_buffers > self.max_output_buffers {
            bail!("guaranteed output buffers ({}) must not exceed max output buffers ({})", self.guaranteed_output_buffers, self.max_output_buffers);
        }
        validate_flush_order(&self.flush_order)?;
        if self.compression_level > 9 {
            bail!("compression level must be between 0 and 9");
        }
        if let Some(threshold) = self.compression_threshold {
            if threshold < self.compression_type.min_threshold() {
                bail!("compression threshold must be at least {} for {:?}", self.compression_type.min_threshold(), self.compression_type);
            }
        }
        Ok(())
    }
}

pub fn validate_flush_order(flush_order: &str) -> anyhow::Result<()> {
    if flush_order.len() > MAX_FLUSH_ORDER_LEN {
        bail!("value cannot exceed {} characters.", MAX_FLUSH_ORDER_LEN);
    }
    if !flush_order.contains('H') || !flush_order.contains('M') {
        bail!("value must contain at least one 'H' and one 'M'.");
    }
    if let Some(c) = flush_order.chars().find(|c| !matches!(c, 'H' | 'M' | 'L')) {
        bail!("value must only contain 'H', 'M' and 'L', found '{}'", c);
    }
    Ok(())
}

/// An HTTP proxy that the connection is tunneled through
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub host: String,
    pub port: u16,
}

/// The application's identity as sent in the handshake
#[derive(Debug, Clone, Default)]
pub struct ProtocolIdentity {
    pub protocol_type: u8,
    pub major_version: u8,
    pub minor_version: u8,
    /// free text, e.g. the product's name and version, sent to peers speaking RIPC 13 or later
    pub component_version: String,
}

/// Settings for a channel that connects to a server
#[derive(Debug, Clone)]
pub struct ConnectConfig {
    pub channel: ChannelConfig,

    pub host: String,
    pub port: u16,
    /// Host name and IP address of this client, as reported to the server
    pub host_name: String,
    pub ip_address: String,

    pub identity: ProtocolIdentity,

    /// The requested ping timeout in seconds. The server may lower it.
    pub ping_timeout: u8,

    pub proxy: Option<ProxyConfig>,
    pub user_agent: String,
    /// Bound on proxy responses that neither authenticate the tunnel nor fail it
    pub max_ignored_proxy_responses: usize,

    /// RIPC versions to try, starting with the first: if the server closes the connection instead
    ///  of answering, the client reconnects with the next version
    pub supported_versions: Vec<RipcVersion>,

    /// Request a key exchange (RIPC 14 only)
    pub key_exchange: bool,
}

impl ConnectConfig {
    pub fn new(host: impl Into<String>, port: u16) -> ConnectConfig {
        ConnectConfig {
            channel: ChannelConfig::default(),
            host: host.into(),
            port,
            host_name: String::new(),
            ip_address: String::new(),
            identity: ProtocolIdentity::default(),
            ping_timeout: 60,
            proxy: None,
            user_agent: format!("ripc-transport/{}", env!("CARGO_PKG_VERSION")),
            max_ignored_proxy_responses: 10000,
            supported_versions: RipcVersion::ALL_DESCENDING.to_vec(),
            key_exchange: false,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.channel.validate()?;
        if self.supported_versions.is_empty() {
            bail!("at least one RIPC version must be supported");
        }
        if self.supported_versions.windows(2).any(|w| w[0] <= w[1]) {
            bail!("supported RIPC versions must be in descending order");
        }
        if self.host_name.len() > u8::MAX as usize || self.ip_address.len() > u8::MAX as usize {
            bail!("host name and IP address must not exceed {} bytes", u8::MAX);
        }
        if self.identity.component_version.len() > u8::MAX as usize - 1 {
            bail!("component version must not exceed {} bytes", u8::MAX - 1);
        }
        Ok(())
    }
}

/// Settings for channels that a server accepts
#[derive(Debug, Clone)]
pub struct AcceptConfig {
    pub channel: ChannelConfig,

    /// The largest frame payload this server sends or accepts. This determines the block size.
    pub max_user_msg_size: usize,

    /// in seconds: requests are clamped to [min_ping_timeout, ping_timeout]
    pub ping_timeout: u8,
    pub min_ping_timeout: u8,

    pub identity: ProtocolIdentity,

    /// Use `channel.compression_type` even if the client did not ask for it
    pub force_compression: bool,
    pub key_exchange: bool,
}

impl AcceptConfig {
    pub const MIN_USER_MSG_SIZE: usize = 64;
    pub const MAX_USER_MSG_SIZE: usize = u16::MAX as usize - 3;

    pub fn new() -> AcceptConfig {
        AcceptConfig {
            channel: ChannelConfig::default(),
            max_user_msg_size: 6144,
            ping_timeout: 60,
            min_ping_timeout: 20,
            identity: ProtocolIdentity::default(),
            force_compression: false,
            key_exchange: false,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.channel.validate()?;
        if self.max_user_msg_size < Self::MIN_USER_MSG_SIZE || self.max_user_msg_size > Self::MAX_USER_MSG_SIZE {
            bail!("max user message size must be between {} and {}", Self::MIN_USER_MSG_SIZE, Self::MAX_USER_MSG_SIZE);
        }
        if self.min_ping_timeout > self.ping_timeout {
            bail!("min ping timeout must not exceed ping timeout");
        }
        if self.identity.component_version.len() > u8::MAX as usize - 1 {
            bail!("component version must not exceed {} bytes", u8::MAX - 1);
        }
        Ok(())
    }
}
