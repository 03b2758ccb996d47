//! Registry of channels in handshake, keyed by handshake nonce.
//!
//! Every channel is registered here for the duration of its handshake. A
//! received version message whose nonce is present in this registry was
//! written by this node: the connection loops back to ourselves and must be
//! rejected.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::channel::Channel;
use crate::error::{P2pError, P2pResult};

/// Channels currently in handshake.
pub struct Pending {
    channels: Mutex<HashMap<u64, Arc<Channel>>>,
}

impl Pending {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Whether a handshake with this nonce is in flight.
    pub async fn exists(&self, nonce: u64) -> bool {
        self.channels.lock().await.contains_key(&nonce)
    }

    /// Register a channel under its handshake nonce.
    pub async fn store(&self, channel: Arc<Channel>) -> P2pResult<()> {
        let mut channels = self.channels.lock().await;
        if channels.contains_key(&channel.nonce()) {
            return Err(P2pError::AddressInUse);
        }
        channels.insert(channel.nonce(), channel);
        Ok(())
    }

    /// Deregister a channel. Succeeds whether or not it was present.
    pub async fn remove(&self, channel: &Arc<Channel>) -> P2pResult<()> {
        self.channels.lock().await.remove(&channel.nonce());
        Ok(())
    }

    /// Number of handshakes in flight.
    pub async fn count(&self) -> usize {
        self.channels.lock().await.len()
    }
}

impl Default for Pending {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Direction;

    fn channel(addr: &str) -> Arc<Channel> {
        Channel::for_tests(addr.parse().unwrap(), Direction::Outbound)
    }

    #[tokio::test]
    async fn test_store_exists_remove() {
        let pending = Pending::new();
        let ch = channel("203.0.113.1:7333");
        let nonce = ch.nonce();

        assert!(!pending.exists(nonce).await);
        pending.store(ch.clone()).await.unwrap();
        assert!(pending.exists(nonce).await);
        assert_eq!(pending.count().await, 1);

        pending.remove(&ch).await.unwrap();
        assert!(!pending.exists(nonce).await);
        assert_eq!(pending.count().await, 0);

        // Removing again still succeeds.
        pending.remove(&ch).await.unwrap();
    }

    #[tokio::test]
    async fn test_nonces_are_distinct() {
        let pending = Pending::new();
        let a = channel("203.0.113.1:7333");
        let b = channel("203.0.113.2:7333");
        assert_ne!(a.nonce(), b.nonce());

        pending.store(a).await.unwrap();
        pending.store(b).await.unwrap();
        assert_eq!(pending.count().await, 2);
    }

    #[tokio::test]
    async fn test_duplicate_nonce_rejected() {
        let pending = Pending::new();
        let ch = channel("203.0.113.1:7333");

        pending.store(ch.clone()).await.unwrap();
        assert_eq!(
            pending.store(ch.clone()).await,
            Err(P2pError::AddressInUse)
        );
    }
}
