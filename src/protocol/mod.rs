//! Per-channel protocol state machines.
//!
//! Protocols hold no IO. Each reacts to channel events with a list of
//! [`Action`]s that the channel task executes against the transport and the
//! coordinator facilities. The version handshake and the seed harvest are
//! drivers that run before a channel owns a task; ping and address exchange
//! are attached to every promoted channel.

pub mod address;
pub mod ping;
pub mod seed;
pub mod version;

pub use address::AddressProtocol;
pub use ping::PingProtocol;

use crate::error::P2pError;
use crate::wire::{Message, NetworkAddress};

/// Work a protocol asks the channel task to perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Write a message to the peer.
    Send(Message),
    /// Submit gossiped addresses to the host pool.
    StoreAddresses(Vec<NetworkAddress>),
    /// Reply with up to `max` addresses sampled from the host pool.
    SendAddresses {
        /// Response size cap.
        max: usize,
    },
    /// Request the peer's addresses, but only while the host pool holds
    /// fewer than `below` entries.
    RequestAddresses {
        /// Low-water mark on the pool size.
        below: usize,
    },
    /// Stop the channel with a code.
    Stop(P2pError),
}

/// A state machine attached to a promoted channel.
pub trait Protocol: Send {
    /// Protocol name, for logging.
    fn name(&self) -> &'static str;

    /// Called once when the protocol is attached.
    fn on_attach(&mut self) -> Vec<Action> {
        Vec::new()
    }

    /// Offer a received message. `None` means the message is not this
    /// protocol's concern.
    fn on_message(&mut self, message: &Message) -> Option<Vec<Action>>;

    /// Called on every heartbeat tick.
    fn on_heartbeat(&mut self) -> Vec<Action> {
        Vec::new()
    }

    /// Called on every revival tick.
    fn on_revival(&mut self) -> Vec<Action> {
        Vec::new()
    }

    /// Called exactly once with the channel stop code.
    fn on_stop(&mut self, _code: &P2pError) {}
}
