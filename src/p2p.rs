//! The top-level networking coordinator.
//!
//! Owns the worker pool, the registries, the event bus, and the manual
//! session, and sequences the start/run/stop lifecycle. Every method other
//! than `start` and `stop` is safe to call from any task.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;

use crate::channel::Channel;
use crate::config::Settings;
use crate::context::Context;
use crate::error::{P2pError, P2pResult};
use crate::session::{InboundSession, ManualSession, OutboundSession, SeedSession};
use crate::subscription::ChannelEvent;
use crate::wire::{Message, NetworkAddress};

/// The peer-to-peer networking service.
///
/// ```no_run
/// use galena_p2p::{P2p, Settings};
///
/// # async fn example() -> galena_p2p::P2pResult<()> {
/// let p2p = P2p::new(Settings::testnet());
/// p2p.start().await?;
/// p2p.run().await?;
/// // ...
/// p2p.close().await;
/// # Ok(())
/// # }
/// ```
pub struct P2p {
    context: Arc<Context>,
    /// Lifecycle flag; the subscriber bus carries its own copy under the
    /// mutex shared with `subscribe`.
    stopped: AtomicBool,
    /// Kept reachable so `connect` works after `start`.
    manual: Mutex<Option<Arc<ManualSession>>>,
}

impl P2p {
    /// Construct the service in the stopped state.
    pub fn new(settings: Settings) -> Self {
        Self {
            context: Context::new(settings),
            stopped: AtomicBool::new(true),
            manual: Mutex::new(None),
        }
    }

    /// The settings this service was built with.
    pub fn settings(&self) -> &Settings {
        &self.context.settings
    }

    /// Current blockchain height advertised during handshakes.
    pub fn height(&self) -> u64 {
        self.context.height()
    }

    /// Record a new blockchain height.
    pub fn set_height(&self, value: u64) {
        self.context.set_height(value);
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Start the service: manual session, hosts file load, then seeding.
    ///
    /// Fails with `OperationFailed` if already started. Any stage error is
    /// surfaced and leaves the service in its partial state; it must be
    /// stopped before another start.
    pub async fn start(&self) -> P2pResult<()> {
        if self
            .stopped
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(P2pError::OperationFailed("already started".to_string()));
        }

        // Coalesce work left over from a previous run before accepting new
        // work on the facilities.
        self.context.pool.join().await;
        self.context.pool.start();
        self.context.subscriber.start();
        self.context.connections.start().await;

        let manual = ManualSession::new(self.context.clone());
        if let Err(e) = manual.start().await {
            tracing::error!(error = %e, "error starting manual session");
            return Err(e);
        }
        *self.manual.lock().expect("manual session poisoned") = Some(manual);
        if self.is_stopped() {
            return Err(P2pError::ServiceStopped);
        }

        if let Err(e) = self.context.hosts.load().await {
            tracing::error!(error = %e, "error loading host addresses");
            return Err(e);
        }
        if self.is_stopped() {
            return Err(P2pError::ServiceStopped);
        }

        let seed = SeedSession::new(self.context.clone());
        if let Err(e) = seed.start().await {
            tracing::error!(error = %e, "error seeding host addresses");
            return Err(e);
        }
        if self.is_stopped() {
            return Err(P2pError::ServiceStopped);
        }

        tracing::info!("network started");
        Ok(())
    }

    /// Run the service: inbound acceptor, then outbound maintenance.
    /// Legal only after a successful [`P2p::start`].
    pub async fn run(&self) -> P2pResult<()> {
        if self.is_stopped() {
            return Err(P2pError::ServiceStopped);
        }

        let inbound = InboundSession::new(self.context.clone());
        if let Err(e) = inbound.start().await {
            tracing::error!(error = %e, "error starting inbound session");
            return Err(e);
        }
        if self.is_stopped() {
            return Err(P2pError::ServiceStopped);
        }

        let outbound = OutboundSession::new(self.context.clone());
        if let Err(e) = outbound.start().await {
            tracing::error!(error = %e, "error starting outbound session");
            return Err(e);
        }
        if self.is_stopped() {
            return Err(P2pError::ServiceStopped);
        }

        tracing::info!("network running");
        Ok(())
    }

    /// Stop the service, returning the hosts file save result.
    ///
    /// Idempotent: a second stop returns `ServiceStopped` and does nothing.
    /// All shutdown work is queued before this returns; pending subscribers
    /// are flushed, every channel stops with `ServiceStopped`, and the pool
    /// refuses further work.
    pub async fn stop(&self) -> P2pResult<()> {
        if self
            .stopped
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(P2pError::ServiceStopped);
        }

        *self.manual.lock().expect("manual session poisoned") = None;
        self.context.subscriber.stop();
        self.context
            .connections
            .stop(P2pError::ServiceStopped)
            .await;

        let saved = self.context.hosts.save().await;
        if let Err(e) = &saved {
            tracing::error!(error = %e, "error saving hosts file");
        }

        self.context.pool.shutdown();
        tracing::info!("network stopped");
        saved
    }

    /// Stop (ignoring the result) and wait for all queued work to finish.
    pub async fn close(&self) {
        let _ = self.stop().await;
        self.context.pool.join().await;
    }

    // Connections registry.

    /// Whether a channel to the address's IP exists.
    pub async fn connected(&self, addr: &SocketAddr) -> bool {
        self.context.connections.exists(addr).await
    }

    /// Store a channel in the registry.
    pub async fn store_channel(&self, channel: Arc<Channel>) -> P2pResult<()> {
        self.context.connections.store(channel).await
    }

    /// Remove a channel from the registry.
    pub async fn remove_channel(&self, channel: &Arc<Channel>) -> P2pResult<()> {
        self.context.connections.remove(channel).await
    }

    /// Number of live channels.
    pub async fn connected_count(&self) -> usize {
        self.context.connections.count().await
    }

    /// Send a message to every live channel, returning the delivery count.
    pub async fn broadcast(&self, message: Message) -> usize {
        self.context.connections.broadcast(message).await
    }

    // Hosts store.

    /// Fetch a random candidate address from the pool.
    pub async fn fetch_address(&self) -> P2pResult<NetworkAddress> {
        self.context.hosts.fetch().await
    }

    /// Store one address in the pool.
    pub async fn store_address(&self, address: NetworkAddress) -> P2pResult<()> {
        self.context.hosts.store(address).await
    }

    /// Store a batch of addresses in the pool.
    pub async fn store_addresses(&self, addresses: Vec<NetworkAddress>) -> P2pResult<()> {
        self.context.hosts.store_many(addresses).await
    }

    /// Remove an address from the pool.
    pub async fn remove_address(&self, address: &SocketAddr) -> P2pResult<()> {
        self.context.hosts.remove(address).await
    }

    /// Number of pooled addresses.
    pub async fn address_count(&self) -> usize {
        self.context.hosts.count().await
    }

    // Pending registry.

    /// Register a channel in handshake.
    pub async fn pend(&self, channel: Arc<Channel>) -> P2pResult<()> {
        self.context.pending.store(channel).await
    }

    /// Deregister a channel in handshake.
    pub async fn unpend(&self, channel: &Arc<Channel>) -> P2pResult<()> {
        self.context.pending.remove(channel).await
    }

    /// Whether a handshake nonce is registered.
    pub async fn pent(&self, nonce: u64) -> bool {
        self.context.pending.exists(nonce).await
    }

    /// Number of handshakes in flight.
    pub async fn pent_count(&self) -> usize {
        self.context.pending.count().await
    }

    // Manual connections.

    /// Maintain a connection to `host:port`.
    pub fn connect(&self, host: &str, port: u16) {
        let _ = self.connect_with_handler(host, port);
    }

    /// Maintain a connection to `host:port`; the receiver completes exactly
    /// once with the first established channel or the final error.
    pub fn connect_with_handler(
        &self,
        host: &str,
        port: u16,
    ) -> oneshot::Receiver<P2pResult<Arc<Channel>>> {
        let manual = self.manual.lock().expect("manual session poisoned").clone();
        match manual {
            Some(session) if !self.is_stopped() => session.connect_with_handler(host, port),
            _ => {
                let (tx, rx) = oneshot::channel();
                let _ = tx.send(Err(P2pError::ServiceStopped));
                rx
            }
        }
    }

    // Subscription bus.

    /// Register for the next channel event: the next promoted channel, or
    /// `ServiceStopped` when the service shuts down.
    pub fn subscribe(&self) -> P2pResult<oneshot::Receiver<ChannelEvent>> {
        self.context.subscriber.subscribe()
    }

    /// Deliver a channel event to all registered subscribers. Reachable for
    /// embedders but primarily driven by channel promotion.
    pub fn relay(&self, event: ChannelEvent) {
        self.context.subscriber.relay(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn quiet_settings(dir: &std::path::Path) -> Settings {
        // No listening, no outbound maintenance, no seeds: lifecycle only.
        Settings::mainnet()
            .with_inbound_port(0)
            .with_outbound_connections(0)
            .with_seeds(Vec::new())
            .with_hosts_file(dir.join("hosts.json"))
    }

    /// Pre-write a stocked hosts file so `start` skips seeding.
    async fn stock_hosts(settings: &Settings) {
        crate::hosts::file::save(
            &settings.hosts_file,
            &[NetworkAddress::new("203.0.113.1".parse().unwrap(), 7333, 1)],
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_height_roundtrip() {
        let dir = tempdir().unwrap();
        let p2p = P2p::new(quiet_settings(dir.path()));
        assert_eq!(p2p.height(), 0);
        p2p.set_height(812_000);
        assert_eq!(p2p.height(), 812_000);
    }

    #[tokio::test]
    async fn test_double_start_fails() {
        let dir = tempdir().unwrap();
        let settings = quiet_settings(dir.path());
        stock_hosts(&settings).await;
        let p2p = P2p::new(settings);

        p2p.start().await.unwrap();
        assert!(matches!(
            p2p.start().await,
            Err(P2pError::OperationFailed(_))
        ));

        p2p.close().await;
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let dir = tempdir().unwrap();
        let settings = quiet_settings(dir.path());
        stock_hosts(&settings).await;
        let p2p = P2p::new(settings);

        p2p.start().await.unwrap();
        assert!(p2p.stop().await.is_ok());
        assert_eq!(p2p.stop().await, Err(P2pError::ServiceStopped));
        p2p.close().await;
    }

    #[tokio::test]
    async fn test_run_before_start_fails() {
        let dir = tempdir().unwrap();
        let p2p = P2p::new(quiet_settings(dir.path()));
        assert_eq!(p2p.run().await, Err(P2pError::ServiceStopped));
    }

    #[tokio::test]
    async fn test_subscribe_after_stop_fails() {
        let dir = tempdir().unwrap();
        let settings = quiet_settings(dir.path());
        stock_hosts(&settings).await;
        let p2p = P2p::new(settings);

        p2p.start().await.unwrap();
        let pending = p2p.subscribe().unwrap();

        let _ = p2p.stop().await;
        assert_eq!(
            pending.await.unwrap().err(),
            Some(P2pError::ServiceStopped)
        );
        assert_eq!(p2p.subscribe().err(), Some(P2pError::ServiceStopped));
        p2p.close().await;
    }

    #[tokio::test]
    async fn test_connect_when_stopped_delivers_service_stopped() {
        let dir = tempdir().unwrap();
        let p2p = P2p::new(quiet_settings(dir.path()));
        let rx = p2p.connect_with_handler("127.0.0.1", 1);
        assert_eq!(rx.await.unwrap().err(), Some(P2pError::ServiceStopped));
    }
}
