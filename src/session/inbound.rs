//! Inbound connection session.
//!
//! Binds the configured port and accepts connections for as long as the
//! service runs. Sockets that would violate the registry policy (blacklist,
//! connection limit, duplicate IP) are closed before any handshake work.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};

use crate::channel;
use crate::context::Context;
use crate::error::{P2pError, P2pResult};

/// Session accepting inbound channels.
pub struct InboundSession {
    ctx: Arc<Context>,
}

impl InboundSession {
    /// Create the session over the coordinator facilities.
    pub(crate) fn new(ctx: Arc<Context>) -> Arc<Self> {
        Arc::new(Self { ctx })
    }

    /// Bind the inbound port and install the acceptor.
    ///
    /// Listening is skipped when no port is configured or every connection
    /// slot is reserved for outbound use.
    pub async fn start(self: &Arc<Self>) -> P2pResult<()> {
        if self.ctx.pool.is_stopped() {
            return Err(P2pError::ServiceStopped);
        }

        let settings = &self.ctx.settings;
        if settings.inbound_port == 0 {
            tracing::info!("inbound connections disabled, no port configured");
            return Ok(());
        }
        if settings.connection_limit <= settings.outbound_connections {
            tracing::info!("inbound connections disabled, no spare connection slots");
            return Ok(());
        }

        let listener =
            TcpListener::bind((Ipv4Addr::UNSPECIFIED, settings.inbound_port)).await?;
        tracing::info!(port = settings.inbound_port, "accepting inbound connections");

        let session = self.clone();
        self.ctx.pool.spawn(session.accept_loop(listener));
        Ok(())
    }

    /// Accept until shutdown.
    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        let mut shutdown = self.ctx.pool.shutdown_signal();

        loop {
            let accepted = tokio::select! {
                _ = shutdown.wait_for(|stop| *stop) => break,

                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, addr)) => self.handle(stream, addr).await,
                Err(e) => tracing::warn!(error = %e, "accept error"),
            }
        }

        tracing::debug!("inbound listener stopped");
    }

    /// Screen one accepted socket and hand it off to handshake.
    async fn handle(&self, stream: TcpStream, addr: SocketAddr) {
        let ctx = &self.ctx;

        if ctx.settings.is_blacklisted(&addr) {
            tracing::debug!(addr = %addr, code = %P2pError::ChannelDropped, "rejecting blacklisted peer");
            return;
        }
        if ctx.connections.count().await >= ctx.settings.connection_limit {
            tracing::debug!(addr = %addr, code = %P2pError::ChannelDropped, "rejecting peer, at connection limit");
            return;
        }
        if ctx.connections.exists(&addr).await {
            tracing::debug!(addr = %addr, code = %P2pError::ChannelDropped, "rejecting peer, duplicate IP");
            return;
        }

        let task_ctx = self.ctx.clone();
        ctx.pool.spawn(async move {
            if let Err(e) = channel::accept_inbound(&task_ctx, stream, addr).await {
                tracing::debug!(addr = %addr, error = %e, "inbound channel failed");
            }
        });
    }
}
