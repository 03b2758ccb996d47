//! Outbound connection session.
//!
//! Maintains one background task per outbound slot. A vacant slot fetches a
//! batch of distinct candidates from the host pool and dials them in
//! parallel; the first channel to complete its handshake fills the slot and
//! the losing dials are dropped. Candidates that fail to dial are removed
//! from the pool. The slot refills as soon as its channel stops.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio::time::sleep;

use crate::channel::{self, Channel};
use crate::context::Context;
use crate::error::{P2pError, P2pResult};

/// Pause before retrying a slot that found no usable candidate.
const REFILL_DELAY: Duration = Duration::from_secs(1);

/// Session maintaining the configured number of outbound channels.
pub struct OutboundSession {
    ctx: Arc<Context>,
}

impl OutboundSession {
    /// Create the session over the coordinator facilities.
    pub(crate) fn new(ctx: Arc<Context>) -> Arc<Self> {
        Arc::new(Self { ctx })
    }

    /// Install one maintenance task per outbound slot.
    pub async fn start(self: &Arc<Self>) -> P2pResult<()> {
        if self.ctx.pool.is_stopped() {
            return Err(P2pError::ServiceStopped);
        }

        let settings = &self.ctx.settings;
        if settings.outbound_connections == 0 || settings.host_pool_capacity == 0 {
            tracing::info!("outbound connection maintenance disabled");
            return Ok(());
        }

        tracing::info!(
            slots = settings.outbound_connections,
            batch = settings.connect_batch_size,
            "maintaining outbound connections"
        );
        for slot in 0..settings.outbound_connections {
            let session = self.clone();
            self.ctx.pool.spawn(session.run_slot(slot));
        }
        Ok(())
    }

    /// Keep one slot filled until shutdown.
    async fn run_slot(self: Arc<Self>, slot: usize) {
        let mut shutdown = self.ctx.pool.shutdown_signal();

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.establish(slot).await {
                Ok(channel) => {
                    let mut stop_rx = channel.subscribe_stop();
                    tokio::select! {
                        _ = stop_rx.wait_for(|code| code.is_some()) => {
                            tracing::debug!(slot, addr = %channel.addr(), "slot vacated, refilling");
                        }
                        _ = shutdown.wait_for(|stop| *stop) => break,
                    }
                }
                Err(P2pError::ServiceStopped) => break,
                Err(e) => {
                    tracing::debug!(slot, error = %e, "no outbound channel established");
                    tokio::select! {
                        _ = sleep(REFILL_DELAY) => {}
                        _ = shutdown.wait_for(|stop| *stop) => break,
                    }
                }
            }
        }

        tracing::debug!(slot, "outbound slot released");
    }

    /// Fetch a candidate batch and race the dials; first handshake wins.
    async fn establish(&self, slot: usize) -> P2pResult<Arc<Channel>> {
        let candidates = self.candidates().await?;

        let mut dials: JoinSet<(SocketAddr, P2pResult<Arc<Channel>>)> = JoinSet::new();
        for addr in candidates {
            let ctx = self.ctx.clone();
            dials.spawn(async move { (addr, channel::open_outbound(&ctx, addr).await) });
        }

        let mut winner: Option<Arc<Channel>> = None;
        let mut last_error = P2pError::AddressNotFound;
        while let Some(joined) = dials.join_next().await {
            let Ok((addr, result)) = joined else {
                continue;
            };
            match result {
                Ok(channel) => {
                    tracing::debug!(slot, addr = %addr, "slot filled");
                    winner = Some(channel);
                    break;
                }
                Err(e) => {
                    tracing::debug!(slot, addr = %addr, error = %e, "candidate failed");
                    // Registry rejections are not the candidate's fault.
                    let unreachable = !matches!(
                        e,
                        P2pError::ServiceStopped
                            | P2pError::AddressInUse
                            | P2pError::ResourceLimit
                    );
                    if unreachable {
                        let _ = self.ctx.hosts.remove(&addr).await;
                    }
                    last_error = e;
                }
            }
        }

        // Losing dials are dropped, including any that complete while the
        // winner was being selected.
        dials.abort_all();
        while let Some(joined) = dials.join_next().await {
            if let Ok((addr, Ok(late))) = joined {
                tracing::debug!(slot, addr = %addr, "dropping losing dial");
                late.stop(P2pError::ChannelDropped);
            }
        }

        winner.ok_or(last_error)
    }

    /// Up to `connect_batch_size` distinct, not-yet-connected candidates.
    async fn candidates(&self) -> P2pResult<Vec<SocketAddr>> {
        let batch = self.ctx.settings.connect_batch_size.max(1);
        let mut candidates: Vec<SocketAddr> = Vec::new();

        for _ in 0..batch * 2 {
            if candidates.len() >= batch {
                break;
            }
            let address = match self.ctx.hosts.fetch().await {
                Ok(address) => address,
                Err(P2pError::AddressNotFound) => break,
                Err(e) => return Err(e),
            };
            let addr = address.socket_addr();
            if !candidates.contains(&addr) && !self.ctx.connections.exists(&addr).await {
                candidates.push(addr);
            }
        }

        if candidates.is_empty() {
            return Err(P2pError::AddressNotFound);
        }
        Ok(candidates)
    }
}
