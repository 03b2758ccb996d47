//! Shared facilities injected into sessions and channels.
//!
//! Sessions and channels never hold the coordinator itself; they see it only
//! through this context, so the coordinator cannot be kept alive by its own
//! workers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::config::Settings;
use crate::connections::Connections;
use crate::hosts::Hosts;
use crate::pending::Pending;
use crate::pool::WorkerPool;
use crate::subscription::Subscriber;

/// Handles to the coordinator-owned facilities.
pub struct Context {
    /// Immutable configuration.
    pub settings: Arc<Settings>,
    /// Background task pool.
    pub pool: Arc<WorkerPool>,
    /// Persistent address pool.
    pub hosts: Arc<Hosts>,
    /// Live channel registry.
    pub connections: Arc<Connections>,
    /// Handshake registry.
    pub pending: Arc<Pending>,
    /// Channel event bus.
    pub subscriber: Arc<Subscriber>,
    /// Current blockchain height, advertised in version messages.
    height: AtomicU64,
}

impl Context {
    /// Build the facility set for a settings instance.
    pub fn new(settings: Settings) -> Arc<Self> {
        let hosts = Arc::new(Hosts::new(&settings));
        let connections = Arc::new(Connections::new(settings.connection_limit));
        Arc::new(Self {
            settings: Arc::new(settings),
            pool: Arc::new(WorkerPool::new()),
            hosts,
            connections,
            pending: Arc::new(Pending::new()),
            subscriber: Arc::new(Subscriber::new()),
            height: AtomicU64::new(0),
        })
    }

    /// Current blockchain height.
    pub fn height(&self) -> u64 {
        self.height.load(Ordering::Relaxed)
    }

    /// Record a new blockchain height.
    pub fn set_height(&self, value: u64) {
        self.height.store(value, Ordering::Relaxed);
    }
}
