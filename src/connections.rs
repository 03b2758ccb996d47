//! Registry of live channels.
//!
//! Bounded by the connection limit, with at most one channel per remote IP.
//! The registry carries its own stopped flag, set synchronously inside
//! [`Connections::stop`], so no store can succeed once shutdown has begun.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::channel::Channel;
use crate::error::{P2pError, P2pResult};
use crate::wire::Message;

struct Inner {
    stopped: bool,
    channels: HashMap<IpAddr, Arc<Channel>>,
}

/// Set of currently established channels.
pub struct Connections {
    limit: usize,
    inner: Mutex<Inner>,
}

impl Connections {
    /// Create an empty registry bounded by `limit`.
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            inner: Mutex::new(Inner {
                stopped: false,
                channels: HashMap::new(),
            }),
        }
    }

    /// Accept stores again after a stop.
    pub async fn start(&self) {
        self.inner.lock().await.stopped = false;
    }

    /// Whether a channel to the address's IP exists.
    pub async fn exists(&self, addr: &SocketAddr) -> bool {
        self.inner.lock().await.channels.contains_key(&addr.ip())
    }

    /// Number of live channels.
    pub async fn count(&self) -> usize {
        self.inner.lock().await.channels.len()
    }

    /// Insert a channel.
    ///
    /// Fails with `AddressInUse` when a channel to the same remote IP is
    /// present, `ResourceLimit` at the connection limit, and
    /// `ServiceStopped` after [`Connections::stop`].
    pub async fn store(&self, channel: Arc<Channel>) -> P2pResult<()> {
        let mut inner = self.inner.lock().await;
        if inner.stopped {
            return Err(P2pError::ServiceStopped);
        }
        if inner.channels.len() >= self.limit {
            return Err(P2pError::ResourceLimit);
        }

        let ip = channel.addr().ip();
        if inner.channels.contains_key(&ip) {
            return Err(P2pError::AddressInUse);
        }

        inner.channels.insert(ip, channel);
        Ok(())
    }

    /// Remove a channel if it is the registered one for its IP.
    pub async fn remove(&self, channel: &Arc<Channel>) -> P2pResult<()> {
        let mut inner = self.inner.lock().await;
        let ip = channel.addr().ip();
        if let Some(existing) = inner.channels.get(&ip) {
            if Arc::ptr_eq(existing, channel) {
                inner.channels.remove(&ip);
            }
        }
        Ok(())
    }

    /// Send a message to every live channel, returning the delivery count.
    pub async fn broadcast(&self, message: Message) -> usize {
        let channels: Vec<Arc<Channel>> = {
            let inner = self.inner.lock().await;
            inner.channels.values().cloned().collect()
        };

        let mut delivered = 0;
        for channel in channels {
            match channel.send(message.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    tracing::debug!(addr = %channel.addr(), error = %e, "broadcast skipped channel")
                }
            }
        }
        delivered
    }

    /// Stop every channel with `code` and refuse further stores.
    pub async fn stop(&self, code: P2pError) {
        let channels: Vec<Arc<Channel>> = {
            let mut inner = self.inner.lock().await;
            inner.stopped = true;
            inner.channels.drain().map(|(_, channel)| channel).collect()
        };

        for channel in channels {
            channel.stop(code.clone());
        }
    }
}
