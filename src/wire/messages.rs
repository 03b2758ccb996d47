//! Protocol messages consumed by the networking core.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Seconds since the Unix epoch, truncated to the 4-byte wire form.
pub fn unix_time() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

/// A peer endpoint as exchanged in address gossip.
///
/// Equality and hashing consider only `ip` and `port`; `services` and
/// `timestamp` are advisory metadata refreshed on sighting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkAddress {
    /// Peer IP.
    pub ip: IpAddr,
    /// Peer TCP port.
    pub port: u16,
    /// Advertised service bits.
    pub services: u64,
    /// Last time the peer was seen (Unix seconds).
    pub timestamp: u32,
}

impl NetworkAddress {
    /// Create an address seen now.
    pub fn new(ip: IpAddr, port: u16, services: u64) -> Self {
        Self {
            ip,
            port,
            services,
            timestamp: unix_time(),
        }
    }

    /// Create an address from a socket address.
    pub fn from_socket(addr: SocketAddr, services: u64) -> Self {
        Self::new(addr.ip(), addr.port(), services)
    }

    /// The unroutable placeholder advertised when no self address is set.
    pub fn unspecified(services: u64) -> Self {
        Self::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0, services)
    }

    /// The socket form of this address.
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

impl PartialEq for NetworkAddress {
    fn eq(&self, other: &Self) -> bool {
        self.ip == other.ip && self.port == other.port
    }
}

impl Eq for NetworkAddress {}

impl Hash for NetworkAddress {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.ip.hash(state);
        self.port.hash(state);
    }
}

impl fmt::Display for NetworkAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.socket_addr())
    }
}

/// Version information exchanged during the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionMessage {
    /// Protocol version of the sender.
    pub protocol_version: u32,
    /// Service bits of the sender.
    pub services: u64,
    /// Time the message was created (Unix seconds).
    pub timestamp: u64,
    /// Address of the receiving peer as seen by the sender.
    pub receiver: NetworkAddress,
    /// Advertised address of the sender.
    pub sender: NetworkAddress,
    /// Random handshake nonce, used for self-connection detection.
    pub nonce: u64,
    /// User agent of the sender.
    pub user_agent: String,
    /// Current blockchain height of the sender.
    pub start_height: u64,
    /// Whether the sender wants transactions relayed to it.
    pub relay: bool,
}

/// Messages the networking core sends and consumes.
///
/// Commands outside this set decode to [`Message::Unknown`] and are relayed
/// to channel message subscribers unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// Handshake opener.
    Version(VersionMessage),
    /// Handshake acknowledgment.
    Verack,
    /// Keep-alive probe with a nonce.
    Ping(u64),
    /// Keep-alive reply echoing the nonce.
    Pong(u64),
    /// Request for known peer addresses.
    GetAddresses,
    /// Peer address gossip.
    Addresses(Vec<NetworkAddress>),
    /// A command this core does not consume; payload is passed through
    /// verbatim.
    Unknown {
        /// Wire command name.
        command: String,
        /// Raw payload bytes.
        payload: Vec<u8>,
    },
}

impl Message {
    /// The wire command for this message.
    pub fn command(&self) -> &str {
        match self {
            Message::Version(_) => "version",
            Message::Verack => "verack",
            Message::Ping(_) => "ping",
            Message::Pong(_) => "pong",
            Message::GetAddresses => "getaddr",
            Message::Addresses(_) => "addr",
            Message::Unknown { command, .. } => command,
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::Version(v) => write!(
                f,
                "version(protocol={}, height={}, agent={})",
                v.protocol_version, v.start_height, v.user_agent
            ),
            Message::Verack => write!(f, "verack"),
            Message::Ping(n) => write!(f, "ping({})", n),
            Message::Pong(n) => write!(f, "pong({})", n),
            Message::GetAddresses => write!(f, "getaddr"),
            Message::Addresses(list) => write!(f, "addr(count={})", list.len()),
            Message::Unknown { command, payload } => {
                write!(f, "{}(bytes={})", command, payload.len())
            }
        }
    }
}
