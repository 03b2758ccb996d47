//! Seed session.
//!
//! Bootstraps an empty host pool by dialing the configured seed endpoints
//! in parallel. Each seed channel handshakes, harvests one address batch,
//! and closes. The session completes once any seed has stocked the pool, or
//! when every seed has failed.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::task::JoinSet;

use crate::channel::{self, ChannelState};
use crate::config::Endpoint;
use crate::context::Context;
use crate::dns::Resolver;
use crate::error::{P2pError, P2pResult};
use crate::protocol::{seed, version};

/// Session bootstrapping the host pool from seed peers.
pub struct SeedSession {
    ctx: Arc<Context>,
    resolver: Resolver,
}

impl SeedSession {
    /// Create the session over the coordinator facilities.
    pub(crate) fn new(ctx: Arc<Context>) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            resolver: Resolver::new(),
        })
    }

    /// Run the seeding pass. Skipped when the pool is already stocked.
    pub async fn start(self: &Arc<Self>) -> P2pResult<()> {
        if self.ctx.pool.is_stopped() {
            return Err(P2pError::ServiceStopped);
        }

        let settings = &self.ctx.settings;
        if settings.host_pool_capacity == 0 {
            tracing::debug!("seeding bypassed, host pool disabled");
            return Ok(());
        }
        if self.ctx.hosts.count().await > 0 {
            tracing::debug!("seeding not required, host pool is stocked");
            return Ok(());
        }
        if settings.seeds.is_empty() {
            tracing::warn!("host pool is empty and no seeds are configured");
            return Err(P2pError::PeerThrottling);
        }

        tracing::info!(seeds = settings.seeds.len(), "contacting seeds");
        let mut harvests: JoinSet<P2pResult<usize>> = JoinSet::new();
        for endpoint in settings.seeds.clone() {
            let session = self.clone();
            harvests.spawn(async move { session.harvest_endpoint(endpoint).await });
        }

        while let Some(joined) = harvests.join_next().await {
            match joined {
                Ok(Ok(count)) => {
                    tracing::debug!(count, "seed harvest complete");
                    if self.ctx.hosts.count().await > 0 {
                        break;
                    }
                }
                Ok(Err(e)) => tracing::debug!(error = %e, "seed harvest failed"),
                Err(_) => {}
            }
        }
        harvests.abort_all();

        if self.ctx.hosts.count().await > 0 {
            Ok(())
        } else {
            tracing::warn!("seeding produced no addresses");
            Err(P2pError::PeerThrottling)
        }
    }

    /// Resolve one seed endpoint and harvest from the first address that
    /// answers.
    async fn harvest_endpoint(self: Arc<Self>, endpoint: Endpoint) -> P2pResult<usize> {
        let addrs = self.resolver.resolve(&endpoint.host, endpoint.port).await?;

        let mut last = P2pError::AddressNotFound;
        for addr in addrs {
            match self.harvest_addr(addr).await {
                Ok(count) => return Ok(count),
                Err(e) => {
                    tracing::debug!(seed = %endpoint, addr = %addr, error = %e, "seed dial failed");
                    last = e;
                }
            }
        }
        Err(last)
    }

    /// Dial, handshake, harvest, and cleanly close one seed channel.
    async fn harvest_addr(&self, addr: SocketAddr) -> P2pResult<usize> {
        let ctx = &self.ctx;
        let (channel, mut framed, _cmd_rx) = channel::dial(ctx, addr).await?;

        channel.set_state(ChannelState::Handshaking);
        ctx.pending.store(channel.clone()).await?;
        let handshake = version::perform(&mut framed, &channel, ctx).await;
        let _ = ctx.pending.remove(&channel).await;

        let peer_version = match handshake {
            Ok(peer_version) => peer_version,
            Err(e) => {
                channel.stop(e.clone());
                return Err(e);
            }
        };
        channel.set_peer_version(peer_version);

        let result = seed::harvest(
            &mut framed,
            &ctx.hosts,
            ctx.settings.channel_germination,
        )
        .await;
        channel.stop(P2pError::ChannelStopped);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::wire::NetworkAddress;

    #[tokio::test]
    async fn test_seeding_skipped_when_pool_is_stocked() {
        let ctx = Context::new(Settings::mainnet());
        ctx.pool.start();
        ctx.hosts
            .store(NetworkAddress::new("203.0.113.1".parse().unwrap(), 7333, 1))
            .await
            .unwrap();

        let session = SeedSession::new(ctx.clone());
        assert!(session.start().await.is_ok());

        ctx.pool.shutdown();
        ctx.pool.join().await;
    }

    #[tokio::test]
    async fn test_empty_pool_without_seeds_throttles() {
        let ctx = Context::new(Settings::mainnet().with_seeds(Vec::new()));
        ctx.pool.start();

        let session = SeedSession::new(ctx.clone());
        assert_eq!(session.start().await, Err(P2pError::PeerThrottling));

        ctx.pool.shutdown();
        ctx.pool.join().await;
    }

    #[tokio::test]
    async fn test_seeding_after_shutdown_fails() {
        let ctx = Context::new(Settings::mainnet());
        let session = SeedSession::new(ctx);
        assert_eq!(session.start().await, Err(P2pError::ServiceStopped));
    }
}
