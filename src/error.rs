//! Network error codes.
//!
//! Errors are values carried across completion boundaries, never panics.
//! The variants below are the stable vocabulary seen by callers; textual
//! detail is attached where a code alone would not be enough to log usefully.

use std::io;

use thiserror::Error;

/// Errors produced by the networking layer.
///
/// The enum is cloneable so a single stop code can be delivered to every
/// protocol and subscriber of a channel.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum P2pError {
    /// The service is stopped and cannot accept the operation.
    #[error("service stopped")]
    ServiceStopped,

    /// The operation is invalid in the current state.
    #[error("operation failed: {0}")]
    OperationFailed(String),

    /// No address is available in the host pool.
    #[error("address not found")]
    AddressNotFound,

    /// A channel to the same remote IP already exists.
    #[error("address in use")]
    AddressInUse,

    /// The connection limit has been reached.
    #[error("resource limit reached")]
    ResourceLimit,

    /// The handshake was rejected (self-connection or incompatible peer).
    #[error("accept failed")]
    AcceptFailed,

    /// A channel timer expired (dial, handshake, ping, inactivity or
    /// expiration).
    #[error("channel timed out")]
    ChannelTimeout,

    /// The channel was dropped before promotion.
    #[error("channel dropped")]
    ChannelDropped,

    /// The channel is stopped.
    #[error("channel stopped")]
    ChannelStopped,

    /// Seeding produced no usable addresses.
    #[error("peer throttling")]
    PeerThrottling,

    /// An I/O operation failed.
    #[error("file system error: {0}")]
    FileSystem(String),

    /// The peer sent bytes that could not be decoded.
    #[error("bad stream: {0}")]
    BadStream(String),
}

impl From<io::Error> for P2pError {
    fn from(err: io::Error) -> Self {
        P2pError::FileSystem(err.to_string())
    }
}

/// Result type for all networking operations.
pub type P2pResult<T> = Result<T, P2pError>;
