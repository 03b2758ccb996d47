//! Wire protocol: message types and the framed codec.
//!
//! Payload bodies use a deterministic bincode configuration (fixed-size
//! integers, little-endian, no trailing bytes) so identical messages always
//! produce identical bytes.

pub mod codec;
pub mod messages;

pub use codec::MessageCodec;
pub use messages::{unix_time, Message, NetworkAddress, VersionMessage};

use bincode::Options;
use serde::{de::DeserializeOwned, Serialize};

use crate::error::{P2pError, P2pResult};

fn options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_little_endian()
        .reject_trailing_bytes()
}

/// Serialize a payload body.
pub(crate) fn serialize<T: Serialize>(value: &T) -> P2pResult<Vec<u8>> {
    options()
        .serialize(value)
        .map_err(|e| P2pError::BadStream(e.to_string()))
}

/// Deserialize a payload body.
pub(crate) fn deserialize<T: DeserializeOwned>(bytes: &[u8]) -> P2pResult<T> {
    options()
        .deserialize(bytes)
        .map_err(|e| P2pError::BadStream(e.to_string()))
}
