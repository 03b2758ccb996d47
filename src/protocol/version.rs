//! Version handshake.
//!
//! The dialing side sends its version first; the accepting side waits for
//! it. Either way, each side acknowledges the other's version with a verack
//! and the handshake completes when both the peer version and the peer
//! verack have arrived. The whole exchange is bounded by the handshake
//! timer; for inbound channels the first frame must additionally arrive
//! within the germination window.
//!
//! Every in-flight handshake is registered in the pending registry under
//! its locally-generated nonce. A received version carrying a nonce that is
//! registered there was written by this node: the connection is a loop back
//! to ourselves and is rejected.

use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::time::timeout;

use crate::channel::{Channel, Direction, Transport};
use crate::config::{MIN_PROTOCOL_VERSION, PROTOCOL_VERSION};
use crate::context::Context;
use crate::error::{P2pError, P2pResult};
use crate::wire::{unix_time, Message, NetworkAddress, VersionMessage};

/// Build our version message for a channel.
pub(crate) fn build_version(ctx: &Context, channel: &Channel) -> VersionMessage {
    let settings = &ctx.settings;
    let sender = match settings.self_address {
        Some(addr) => NetworkAddress::from_socket(addr, settings.services),
        None => NetworkAddress::unspecified(settings.services),
    };

    VersionMessage {
        protocol_version: PROTOCOL_VERSION,
        services: settings.services,
        timestamp: u64::from(unix_time()),
        receiver: NetworkAddress::from_socket(channel.addr(), 0),
        sender,
        nonce: channel.nonce(),
        user_agent: settings.user_agent.clone(),
        start_height: ctx.height(),
        relay: settings.relay_transactions,
    }
}

/// Validate a received peer version.
pub(crate) async fn validate(
    ctx: &Context,
    channel: &Channel,
    peer: &VersionMessage,
) -> P2pResult<()> {
    // Our own nonce is registered while we handshake; only a foreign nonce
    // in the registry marks a self-connection.
    if peer.nonce != 0 && peer.nonce != channel.nonce() && ctx.pending.exists(peer.nonce).await {
        tracing::debug!(channel = %channel, nonce = peer.nonce, "connection to self detected");
        return Err(P2pError::AcceptFailed);
    }

    if peer.protocol_version < MIN_PROTOCOL_VERSION {
        tracing::debug!(
            channel = %channel,
            peer_version = peer.protocol_version,
            "peer protocol version too old"
        );
        return Err(P2pError::AcceptFailed);
    }

    Ok(())
}

async fn next_message(framed: &mut Transport) -> P2pResult<Message> {
    match framed.next().await {
        Some(Ok(message)) => Ok(message),
        Some(Err(e)) => Err(e),
        None => Err(P2pError::ChannelDropped),
    }
}

/// Complete the exchange after our version is on the wire: collect the
/// peer's version (acknowledging it) and the peer's verack, in either order.
async fn exchange(
    framed: &mut Transport,
    channel: &Arc<Channel>,
    ctx: &Context,
    mut peer_version: Option<VersionMessage>,
) -> P2pResult<VersionMessage> {
    let mut verack_received = false;

    while peer_version.is_none() || !verack_received {
        match next_message(framed).await? {
            Message::Version(version) => {
                if peer_version.is_some() {
                    return Err(P2pError::BadStream("duplicate version".to_string()));
                }
                validate(ctx, channel, &version).await?;
                framed.send(Message::Verack).await?;
                peer_version = Some(version);
            }
            Message::Verack => {
                if verack_received {
                    return Err(P2pError::BadStream("duplicate verack".to_string()));
                }
                verack_received = true;
            }
            other => {
                return Err(P2pError::BadStream(format!(
                    "unexpected '{}' during handshake",
                    other.command()
                )));
            }
        }
    }

    peer_version.ok_or_else(|| P2pError::BadStream("handshake incomplete".to_string()))
}

/// Run the handshake on a germinating channel and return the peer version.
pub(crate) async fn perform(
    framed: &mut Transport,
    channel: &Arc<Channel>,
    ctx: &Arc<Context>,
) -> P2pResult<VersionMessage> {
    let settings = &ctx.settings;

    match channel.direction() {
        Direction::Outbound => {
            timeout(settings.channel_handshake, async {
                framed
                    .send(Message::Version(build_version(ctx, channel)))
                    .await?;
                exchange(framed, channel, ctx, None).await
            })
            .await
            .map_err(|_| P2pError::ChannelTimeout)?
        }
        Direction::Inbound => {
            // Germination bounds the wait for the peer's first frame.
            let first = timeout(settings.channel_germination, next_message(framed))
                .await
                .map_err(|_| P2pError::ChannelTimeout)??;

            let peer = match first {
                Message::Version(version) => version,
                other => {
                    return Err(P2pError::BadStream(format!(
                        "expected version, got '{}'",
                        other.command()
                    )));
                }
            };

            timeout(settings.channel_handshake, async {
                validate(ctx, channel, &peer).await?;
                framed
                    .send(Message::Version(build_version(ctx, channel)))
                    .await?;
                framed.send(Message::Verack).await?;
                exchange(framed, channel, ctx, Some(peer)).await
            })
            .await
            .map_err(|_| P2pError::ChannelTimeout)?
        }
    }
}
