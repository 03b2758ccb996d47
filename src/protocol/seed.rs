//! Seed harvest protocol.
//!
//! Runs once on a freshly handshaken seed channel: request the seed's
//! addresses, record the response into the host pool, and return so the
//! session can close the channel. The whole harvest is bounded by the
//! germination window.

use futures::{SinkExt, StreamExt};
use tokio::time::{timeout, Duration};

use crate::channel::Transport;
use crate::error::{P2pError, P2pResult};
use crate::hosts::Hosts;
use crate::wire::Message;

/// Request and store the seed's addresses, returning how many arrived.
pub(crate) async fn harvest(
    framed: &mut Transport,
    hosts: &Hosts,
    deadline: Duration,
) -> P2pResult<usize> {
    framed.send(Message::GetAddresses).await?;

    timeout(deadline, async {
        loop {
            match framed.next().await {
                Some(Ok(Message::Addresses(list))) => {
                    let count = list.len();
                    hosts.store_many(list).await?;
                    return Ok(count);
                }
                Some(Ok(Message::GetAddresses)) => {
                    // Seeds ask back; an empty answer keeps the exchange moving.
                    framed.send(Message::Addresses(Vec::new())).await?;
                }
                Some(Ok(other)) => {
                    tracing::trace!(message = %other, "ignoring non-address message from seed");
                }
                Some(Err(e)) => return Err(e),
                None => return Err(P2pError::ChannelDropped),
            }
        }
    })
    .await
    .map_err(|_| P2pError::ChannelTimeout)?
}
