//! Keep-alive protocol.
//!
//! Sends an unsolicited ping with a fresh nonce on every heartbeat tick and
//! expects the echoed pong before the next tick. An unanswered or
//! mismatched pong stops the channel.

use rand::Rng;

use crate::error::P2pError;
use crate::protocol::{Action, Protocol};
use crate::wire::Message;

/// Ping/pong state for one channel.
pub struct PingProtocol {
    /// Nonce of the ping awaiting its pong.
    outstanding: Option<u64>,
}

impl PingProtocol {
    /// Create the protocol with no ping in flight.
    pub fn new() -> Self {
        Self { outstanding: None }
    }
}

impl Default for PingProtocol {
    fn default() -> Self {
        Self::new()
    }
}

impl Protocol for PingProtocol {
    fn name(&self) -> &'static str {
        "ping"
    }

    fn on_message(&mut self, message: &Message) -> Option<Vec<Action>> {
        match message {
            Message::Ping(nonce) => Some(vec![Action::Send(Message::Pong(*nonce))]),
            Message::Pong(nonce) => Some(match self.outstanding {
                Some(expected) if expected == *nonce => {
                    self.outstanding = None;
                    Vec::new()
                }
                _ => {
                    tracing::debug!(nonce, "unexpected pong");
                    vec![Action::Stop(P2pError::ChannelTimeout)]
                }
            }),
            _ => None,
        }
    }

    fn on_heartbeat(&mut self) -> Vec<Action> {
        if self.outstanding.is_some() {
            tracing::debug!("ping unanswered for a full heartbeat interval");
            return vec![Action::Stop(P2pError::ChannelTimeout)];
        }

        let nonce = rand::thread_rng().gen();
        self.outstanding = Some(nonce);
        vec![Action::Send(Message::Ping(nonce))]
    }
}
