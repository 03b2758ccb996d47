//! Address exchange protocol.
//!
//! Requests the peer's known addresses on attach, answers the peer's
//! requests with a bounded sample from the host pool, and submits every
//! gossiped address to the pool. On revival ticks the request is re-issued
//! only while the pool sits below its low-water mark, so long-lived
//! channels restock a drained pool without spamming a full one.

use crate::config::MAX_ADDRESSES_PER_MESSAGE;
use crate::protocol::{Action, Protocol};
use crate::wire::Message;

/// Fraction of the pool capacity used as the revival low-water mark.
const LOW_WATER_DIVISOR: usize = 4;

/// Address exchange state for one channel.
pub struct AddressProtocol {
    /// Pool size below which revival re-requests addresses.
    low_water: usize,
}

impl AddressProtocol {
    /// Create the protocol for a pool of the given capacity.
    pub fn new(pool_capacity: usize) -> Self {
        Self {
            low_water: (pool_capacity / LOW_WATER_DIVISOR).max(1),
        }
    }
}

impl Protocol for AddressProtocol {
    fn name(&self) -> &'static str {
        "address"
    }

    fn on_attach(&mut self) -> Vec<Action> {
        vec![Action::Send(Message::GetAddresses)]
    }

    fn on_message(&mut self, message: &Message) -> Option<Vec<Action>> {
        match message {
            Message::GetAddresses => Some(vec![Action::SendAddresses {
                max: MAX_ADDRESSES_PER_MESSAGE,
            }]),
            Message::Addresses(list) => {
                tracing::debug!(count = list.len(), "received address gossip");
                Some(vec![Action::StoreAddresses(list.clone())])
            }
            _ => None,
        }
    }

    fn on_revival(&mut self) -> Vec<Action> {
        vec![Action::RequestAddresses {
            below: self.low_water,
        }]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::NetworkAddress;

    #[test]
    fn test_attach_requests_addresses() {
        let mut address = AddressProtocol::new(1000);
        assert_eq!(
            address.on_attach(),
            vec![Action::Send(Message::GetAddresses)]
        );
    }

    #[test]
    fn test_request_answered_with_bounded_sample() {
        let mut address = AddressProtocol::new(1000);
        let actions = address.on_message(&Message::GetAddresses).unwrap();
        assert_eq!(
            actions,
            vec![Action::SendAddresses {
                max: MAX_ADDRESSES_PER_MESSAGE
            }]
        );
    }

    #[test]
    fn test_gossip_is_stored() {
        let mut address = AddressProtocol::new(1000);
        let list = vec![NetworkAddress::new("203.0.113.1".parse().unwrap(), 7333, 1)];

        let actions = address.on_message(&Message::Addresses(list.clone())).unwrap();
        assert_eq!(actions, vec![Action::StoreAddresses(list)]);
    }

    #[test]
    fn test_revival_request_is_gated_on_low_water() {
        let mut address = AddressProtocol::new(1000);
        assert_eq!(
            address.on_revival(),
            vec![Action::RequestAddresses { below: 250 }]
        );
    }

    #[test]
    fn test_low_water_has_a_floor() {
        let mut address = AddressProtocol::new(0);
        assert_eq!(
            address.on_revival(),
            vec![Action::RequestAddresses { below: 1 }]
        );
    }

    #[test]
    fn test_ping_not_claimed() {
        let mut address = AddressProtocol::new(1000);
        assert!(address.on_message(&Message::Ping(1)).is_none());
    }
}
