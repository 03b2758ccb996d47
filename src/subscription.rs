//! Channel event bus.
//!
//! Subscribers register one at a time and are consumed one event at a time:
//! every registration receives exactly one event, either the next relayed
//! channel or `ServiceStopped` when the bus is flushed at shutdown.
//!
//! One mutex guards both the stopped flag and the registration list, so a
//! subscription cannot slip in between the stop decision and the flush.

use std::sync::Arc;
use std::sync::Mutex;

use tokio::sync::oneshot;

use crate::channel::Channel;
use crate::error::{P2pError, P2pResult};

/// The event delivered to subscribers: a newly promoted channel, or the
/// stop code when the service shuts down.
pub type ChannelEvent = P2pResult<Arc<Channel>>;

struct Inner {
    stopped: bool,
    waiters: Vec<oneshot::Sender<ChannelEvent>>,
}

/// Exactly-once fan-out of channel events.
pub struct Subscriber {
    inner: Mutex<Inner>,
}

impl Subscriber {
    /// Create a bus in the stopped state; [`Subscriber::start`] opens it.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                stopped: true,
                waiters: Vec::new(),
            }),
        }
    }

    /// Accept registrations.
    pub fn start(&self) {
        self.inner.lock().expect("subscriber poisoned").stopped = false;
    }

    /// Register for the next channel event.
    pub fn subscribe(&self) -> P2pResult<oneshot::Receiver<ChannelEvent>> {
        let mut inner = self.inner.lock().expect("subscriber poisoned");
        if inner.stopped {
            return Err(P2pError::ServiceStopped);
        }
        let (tx, rx) = oneshot::channel();
        inner.waiters.push(tx);
        Ok(rx)
    }

    /// Deliver an event to every registered subscriber, consuming the
    /// registrations.
    pub fn relay(&self, event: ChannelEvent) {
        let waiters: Vec<oneshot::Sender<ChannelEvent>> = {
            let mut inner = self.inner.lock().expect("subscriber poisoned");
            inner.waiters.drain(..).collect()
        };

        for waiter in waiters {
            // A dropped receiver only means the subscriber went away.
            let _ = waiter.send(event.clone());
        }
    }

    /// Refuse new registrations and flush the pending ones with
    /// `ServiceStopped`.
    pub fn stop(&self) {
        let waiters: Vec<oneshot::Sender<ChannelEvent>> = {
            let mut inner = self.inner.lock().expect("subscriber poisoned");
            inner.stopped = true;
            inner.waiters.drain(..).collect()
        };

        for waiter in waiters {
            let _ = waiter.send(Err(P2pError::ServiceStopped));
        }
    }
}

impl Default for Subscriber {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Direction;

    fn channel() -> Arc<Channel> {
        Channel::for_tests("203.0.113.1:7333".parse().unwrap(), Direction::Inbound)
    }

    #[tokio::test]
    async fn test_each_registration_receives_one_event() {
        let bus = Subscriber::new();
        bus.start();

        let first = bus.subscribe().unwrap();
        let second = bus.subscribe().unwrap();

        let ch = channel();
        bus.relay(Ok(ch.clone()));

        assert!(first.await.unwrap().is_ok());
        assert!(second.await.unwrap().is_ok());

        // Registrations were consumed; the next relay reaches nobody.
        let third = bus.subscribe().unwrap();
        bus.relay(Ok(ch));
        assert!(third.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_stop_flushes_pending_registrations() {
        let bus = Subscriber::new();
        bus.start();

        let pending = bus.subscribe().unwrap();
        bus.stop();

        assert_eq!(
            pending.await.unwrap().err(),
            Some(P2pError::ServiceStopped)
        );
        assert_eq!(bus.subscribe().err(), Some(P2pError::ServiceStopped));
    }

    #[tokio::test]
    async fn test_restart_reopens_bus() {
        let bus = Subscriber::new();
        bus.start();
        bus.stop();
        bus.start();
        assert!(bus.subscribe().is_ok());
    }
}
