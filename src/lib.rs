//! Peer-to-peer networking for the Galena node.
//!
//! This crate provides the long-lived networking coordinator for a Galena
//! node, including:
//!
//! - Session lifecycles (seed, manual, inbound, outbound)
//! - A bounded registry of live peer channels
//! - A persistent pool of known peer addresses
//! - An exactly-once event bus delivering newly handshaken channels
//!
//! # Architecture
//!
//! Every channel runs in its own task, pumping the framed transport and
//! driving the channel timers. Sessions create channels and keep their
//! slots filled; registries serialize shared state behind their own locks;
//! the coordinator sequences start/run/stop across all of it.
//!
//! ```text
//! P2p (coordinator)
//! ├── WorkerPool (tracked tasks + shutdown signal)
//! ├── Hosts (persistent address pool)
//! ├── Connections / Pending (registries)
//! ├── Subscriber (channel event bus)
//! └── Sessions
//!     ├── Manual (embedder-requested dials)
//!     ├── Seed (one-shot address harvest)
//!     ├── Outbound (slot maintenance, batched dials)
//!     └── Inbound (acceptor)
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use galena_p2p::{P2p, Settings};
//!
//! # async fn example() -> galena_p2p::P2pResult<()> {
//! let p2p = P2p::new(Settings::mainnet());
//! p2p.start().await?;
//! p2p.run().await?;
//!
//! let next_channel = p2p.subscribe()?;
//! # Ok(())
//! # }
//! ```

pub mod channel;
pub mod config;
pub mod connections;
pub mod context;
pub mod dns;
pub mod error;
pub mod hosts;
pub mod p2p;
pub mod pending;
pub mod pool;
pub mod protocol;
pub mod session;
pub mod subscription;
pub mod wire;

pub use channel::{Channel, ChannelState, Direction};
pub use config::{BlacklistEntry, Endpoint, Settings, PROTOCOL_VERSION};
pub use error::{P2pError, P2pResult};
pub use p2p::P2p;
pub use subscription::ChannelEvent;
pub use wire::{Message, NetworkAddress, VersionMessage};
