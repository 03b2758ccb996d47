//! Manual connection session.
//!
//! Maintains connections to endpoints requested by the embedder. Each
//! request dials with retries and backoff, delivers its completion exactly
//! once on the first established channel (or the final error), and then
//! keeps the connection alive by redialing whenever the channel stops.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::sleep;

use crate::channel::{self, Channel};
use crate::context::Context;
use crate::dns::Resolver;
use crate::error::{P2pError, P2pResult};

/// Base delay between manual retries; grows linearly with the attempt.
const RETRY_DELAY: Duration = Duration::from_secs(1);

/// Longest delay between manual retries.
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Session for embedder-requested connections.
pub struct ManualSession {
    ctx: Arc<Context>,
    resolver: Resolver,
}

impl ManualSession {
    /// Create the session over the coordinator facilities.
    pub(crate) fn new(ctx: Arc<Context>) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            resolver: Resolver::new(),
        })
    }

    /// Install the session.
    pub async fn start(&self) -> P2pResult<()> {
        if self.ctx.pool.is_stopped() {
            return Err(P2pError::ServiceStopped);
        }
        Ok(())
    }

    /// Maintain a connection to `host:port`, discarding the completion.
    pub fn connect(self: &Arc<Self>, host: &str, port: u16) {
        let _ = self.connect_with_handler(host, port);
    }

    /// Maintain a connection to `host:port`. The receiver completes exactly
    /// once, with the first established channel or the final error.
    pub fn connect_with_handler(
        self: &Arc<Self>,
        host: &str,
        port: u16,
    ) -> oneshot::Receiver<P2pResult<Arc<Channel>>> {
        let (tx, rx) = oneshot::channel();

        if self.ctx.pool.is_stopped() {
            let _ = tx.send(Err(P2pError::ServiceStopped));
            return rx;
        }

        let session = self.clone();
        let host = host.to_string();
        self.ctx
            .pool
            .spawn(async move { session.maintain(host, port, tx).await });
        rx
    }

    /// Dial, deliver, and keep redialing until shutdown.
    async fn maintain(
        self: Arc<Self>,
        host: String,
        port: u16,
        handler: oneshot::Sender<P2pResult<Arc<Channel>>>,
    ) {
        let mut handler = Some(handler);
        let retry_limit = self.ctx.settings.manual_retry_limit;
        let mut shutdown = self.ctx.pool.shutdown_signal();
        let mut attempt: u32 = 0;

        loop {
            if *shutdown.borrow() {
                deliver(&mut handler, Err(P2pError::ServiceStopped));
                return;
            }

            attempt += 1;
            match self.try_connect(&host, port).await {
                Ok(channel) => {
                    tracing::info!(host = %host, port, "manual connection established");
                    deliver(&mut handler, Ok(channel.clone()));
                    attempt = 0;

                    let mut stop_rx = channel.subscribe_stop();
                    tokio::select! {
                        _ = stop_rx.wait_for(|code| code.is_some()) => {
                            tracing::debug!(host = %host, port, "manual channel stopped, redialing");
                        }
                        _ = shutdown.wait_for(|stop| *stop) => return,
                    }
                }
                Err(e) => {
                    tracing::debug!(host = %host, port, attempt, error = %e, "manual connect failed");
                    if retry_limit != 0 && attempt >= retry_limit {
                        deliver(&mut handler, Err(e));
                        return;
                    }

                    let delay = (RETRY_DELAY * attempt).min(MAX_RETRY_DELAY);
                    tokio::select! {
                        _ = sleep(delay) => {}
                        _ = shutdown.wait_for(|stop| *stop) => {
                            deliver(&mut handler, Err(P2pError::ServiceStopped));
                            return;
                        }
                    }
                }
            }
        }
    }

    /// One resolution plus dial pass over the endpoint's addresses.
    async fn try_connect(&self, host: &str, port: u16) -> P2pResult<Arc<Channel>> {
        let addrs = self.resolver.resolve(host, port).await?;

        let mut last = P2pError::AddressNotFound;
        for addr in addrs {
            match channel::open_outbound(&self.ctx, addr).await {
                Ok(channel) => return Ok(channel),
                Err(e) => last = e,
            }
        }
        Err(last)
    }
}

fn deliver(
    handler: &mut Option<oneshot::Sender<P2pResult<Arc<Channel>>>>,
    event: P2pResult<Arc<Channel>>,
) {
    if let Some(tx) = handler.take() {
        // A dropped receiver only means the caller stopped caring.
        let _ = tx.send(event);
    }
}
