//! Network settings.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Current protocol version.
pub const PROTOCOL_VERSION: u32 = 70002;

/// Minimum protocol version this node will talk to.
pub const MIN_PROTOCOL_VERSION: u32 = 70001;

/// Minimum peer version for which address exchange is requested.
pub const ADDRESS_PROTOCOL_VERSION: u32 = 70001;

/// Service bit advertising full network relay.
pub const SERVICE_NODE_NETWORK: u64 = 1;

/// Maximum payload size in bytes (1 MB).
pub const MAX_PAYLOAD_SIZE: usize = 1024 * 1024;

/// Maximum addresses returned in a single `addr` response.
pub const MAX_ADDRESSES_PER_MESSAGE: usize = 1000;

/// Network identifier for mainnet ("GALN" little-endian on the wire).
pub const IDENTIFIER_MAINNET: u32 = 0x4e4c_4147;

/// Network identifier for testnet ("galt" little-endian on the wire).
pub const IDENTIFIER_TESTNET: u32 = 0x746c_6167;

/// Default inbound port for mainnet.
pub const PORT_MAINNET: u16 = 7333;

/// Default inbound port for testnet.
pub const PORT_TESTNET: u16 = 17333;

/// Default user agent string.
pub const DEFAULT_USER_AGENT: &str = "/galena-p2p:0.1.0/";

/// A `host:port` endpoint, resolved at connect time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// Hostname or textual IP.
    pub host: String,
    /// TCP port.
    pub port: u16,
}

impl Endpoint {
    /// Create a new endpoint.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// A blacklist rule. Port zero matches every port on the IP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlacklistEntry {
    /// Blacklisted IP.
    pub ip: IpAddr,
    /// Blacklisted port, or zero for all ports.
    pub port: u16,
}

impl BlacklistEntry {
    /// Create a rule for a single `ip:port` pair.
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self { ip, port }
    }

    /// Create a rule matching every port on an IP.
    pub fn all_ports(ip: IpAddr) -> Self {
        Self { ip, port: 0 }
    }

    /// Check whether an address matches this rule.
    pub fn matches(&self, addr: &SocketAddr) -> bool {
        self.ip == addr.ip() && (self.port == 0 || self.port == addr.port())
    }
}

/// Configuration for the networking service.
///
/// Immutable once handed to [`crate::P2p::new`]. The two canonical presets
/// differ only in identifier, inbound port and seed list.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Worker threads for a dedicated runtime built via
    /// [`crate::pool::WorkerPool::build_runtime`].
    pub threads: usize,

    /// Network magic word, written little-endian as the frame magic.
    pub identifier: u32,

    /// Port to accept inbound connections on. Zero disables listening.
    pub inbound_port: u16,

    /// Maximum total number of channels.
    pub connection_limit: usize,

    /// Number of outbound channels to maintain.
    pub outbound_connections: usize,

    /// Retries for a manual connection. Zero retries forever.
    pub manual_retry_limit: u32,

    /// Parallel dial fan-out per outbound slot.
    pub connect_batch_size: usize,

    /// Timeout for establishing a TCP connection.
    pub connect_timeout: Duration,

    /// Bound on the full version handshake.
    pub channel_handshake: Duration,

    /// Interval between unsolicited pings.
    pub channel_heartbeat: Duration,

    /// Idle time after which a channel is dropped.
    pub channel_inactivity: Duration,

    /// Lifetime after which a channel is rotated out.
    pub channel_expiration: Duration,

    /// Maximum time before the handshake begins, and the bound on a
    /// seed harvest.
    pub channel_germination: Duration,

    /// Interval for scheduled message resend on an active channel.
    pub channel_revival: Duration,

    /// Maximum number of addresses retained in the host pool.
    pub host_pool_capacity: usize,

    /// Whether peers should relay transactions to us.
    pub relay_transactions: bool,

    /// Path of the persistent host pool.
    pub hosts_file: PathBuf,

    /// Our own advertised address, if publicly reachable.
    pub self_address: Option<SocketAddr>,

    /// Addresses never stored or dialed.
    pub blacklist: Vec<BlacklistEntry>,

    /// Seed endpoints contacted only to harvest addresses.
    pub seeds: Vec<Endpoint>,

    /// Service bits advertised in the version message.
    pub services: u64,

    /// User agent advertised in the version message.
    pub user_agent: String,
}

impl Settings {
    /// The mainnet preset.
    pub fn mainnet() -> Self {
        Self {
            threads: 4,
            identifier: IDENTIFIER_MAINNET,
            inbound_port: PORT_MAINNET,
            connection_limit: 16,
            outbound_connections: 8,
            manual_retry_limit: 0,
            connect_batch_size: 5,
            connect_timeout: Duration::from_secs(5),
            channel_handshake: Duration::from_secs(30),
            channel_heartbeat: Duration::from_secs(5 * 60),
            channel_inactivity: Duration::from_secs(10 * 60),
            channel_expiration: Duration::from_secs(90 * 60),
            channel_germination: Duration::from_secs(30),
            channel_revival: Duration::from_secs(2 * 60),
            host_pool_capacity: 1000,
            relay_transactions: true,
            hosts_file: PathBuf::from("hosts.json"),
            self_address: None,
            blacklist: Vec::new(),
            seeds: vec![
                Endpoint::new("seed1.galena.network", PORT_MAINNET),
                Endpoint::new("seed2.galena.network", PORT_MAINNET),
                Endpoint::new("seed3.galena.network", PORT_MAINNET),
            ],
            services: SERVICE_NODE_NETWORK,
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }

    /// The testnet preset.
    pub fn testnet() -> Self {
        Self {
            identifier: IDENTIFIER_TESTNET,
            inbound_port: PORT_TESTNET,
            seeds: vec![Endpoint::new("testnet-seed.galena.network", PORT_TESTNET)],
            ..Self::mainnet()
        }
    }

    /// Frame magic bytes derived from the identifier.
    pub fn magic(&self) -> [u8; 4] {
        self.identifier.to_le_bytes()
    }

    /// Check whether an address is blacklisted.
    pub fn is_blacklisted(&self, addr: &SocketAddr) -> bool {
        self.blacklist.iter().any(|rule| rule.matches(addr))
    }

    /// Check whether an address is our own advertised address.
    pub fn is_self(&self, addr: &SocketAddr) -> bool {
        self.self_address.as_ref() == Some(addr)
    }

    /// Set the inbound port.
    pub fn with_inbound_port(mut self, port: u16) -> Self {
        self.inbound_port = port;
        self
    }

    /// Set the total connection limit.
    pub fn with_connection_limit(mut self, limit: usize) -> Self {
        self.connection_limit = limit;
        self
    }

    /// Set the number of outbound connections to maintain.
    pub fn with_outbound_connections(mut self, count: usize) -> Self {
        self.outbound_connections = count;
        self
    }

    /// Set the manual retry limit.
    pub fn with_manual_retry_limit(mut self, limit: u32) -> Self {
        self.manual_retry_limit = limit;
        self
    }

    /// Set the dial fan-out per outbound slot.
    pub fn with_connect_batch_size(mut self, size: usize) -> Self {
        self.connect_batch_size = size;
        self
    }

    /// Set the connection timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the handshake timeout.
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.channel_handshake = timeout;
        self
    }

    /// Set the heartbeat interval.
    pub fn with_heartbeat(mut self, interval: Duration) -> Self {
        self.channel_heartbeat = interval;
        self
    }

    /// Set the inactivity timeout.
    pub fn with_inactivity(mut self, timeout: Duration) -> Self {
        self.channel_inactivity = timeout;
        self
    }

    /// Set the channel expiration.
    pub fn with_expiration(mut self, lifetime: Duration) -> Self {
        self.channel_expiration = lifetime;
        self
    }

    /// Set the germination timeout.
    pub fn with_germination(mut self, timeout: Duration) -> Self {
        self.channel_germination = timeout;
        self
    }

    /// Set the host pool capacity.
    pub fn with_host_pool_capacity(mut self, capacity: usize) -> Self {
        self.host_pool_capacity = capacity;
        self
    }

    /// Set the hosts file path.
    pub fn with_hosts_file(mut self, path: PathBuf) -> Self {
        self.hosts_file = path;
        self
    }

    /// Set our advertised address.
    pub fn with_self_address(mut self, addr: SocketAddr) -> Self {
        self.self_address = Some(addr);
        self
    }

    /// Replace the blacklist.
    pub fn with_blacklist(mut self, rules: Vec<BlacklistEntry>) -> Self {
        self.blacklist = rules;
        self
    }

    /// Replace the seed list.
    pub fn with_seeds(mut self, seeds: Vec<Endpoint>) -> Self {
        self.seeds = seeds;
        self
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self::mainnet()
    }
}
