use std::net::SocketAddr;

use tokio::sync::broadcast;

use crate::id::NodeId;

/// One-way notifications the core publishes to external observers.
///
/// Tagged variants rather than a generic base event downcast to a concrete
/// type by the consumer — observers match on the tag directly.
#[derive(Clone, Debug)]
pub enum Event {
    NodeDiscovered { id: NodeId, addr: SocketAddr },
    NodeAdded { id: NodeId, addr: SocketAddr },
    PeerDiscovered { info_hash: NodeId, addr: SocketAddr },
    InfoHashDiscovered { info_hash: NodeId },
    MessageSent { to: SocketAddr, kind: &'static str },
    MessageReceived { from: SocketAddr, kind: &'static str },
    MetadataAcquired { info_hash: NodeId, name: Option<String>, total_size: u32 },
    SystemError { context: String, message: String },
}

/// A one-way publisher: publish never blocks the caller and observer
/// failures (a full or dropped receiver) never propagate back into the
/// core.
pub trait EventPublisher: Send + Sync + std::fmt::Debug {
    fn publish(&self, event: Event);
}

/// A publisher that drops every event it receives. Used where no observer
/// is wired up (e.g. unit tests exercising a component in isolation).
#[derive(Debug, Default, Clone, Copy)]
pub struct NullEventPublisher;

impl EventPublisher for NullEventPublisher {
    fn publish(&self, _event: Event) {}
}

/// Broadcast-channel backed publisher. Events are delivered at-least-once,
/// in publish order, to every live subscriber; a subscriber that falls
/// behind the channel capacity silently misses the oldest events it hasn't
/// read yet rather than blocking the publisher.
#[derive(Debug, Clone)]
pub struct BroadcastEventPublisher {
    tx: broadcast::Sender<Event>,
}

impl BroadcastEventPublisher {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastEventPublisher {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl EventPublisher for BroadcastEventPublisher {
    fn publish(&self, event: Event) {
        // No receivers is a normal, common state (no observer attached yet);
        // the send error carries the event back but we have nowhere to put it.
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_without_subscribers_does_not_panic() {
        let pub_ = BroadcastEventPublisher::default();
        pub_.publish(Event::SystemError { context: "x".into(), message: "y".into() });
    }

    #[test]
    fn subscriber_receives_in_order() {
        let pub_ = BroadcastEventPublisher::new(8);
        let mut rx = pub_.subscribe();
        pub_.publish(Event::InfoHashDiscovered { info_hash: NodeId::random() });
        pub_.publish(Event::InfoHashDiscovered { info_hash: NodeId::random() });
        let first = rx.try_recv().unwrap();
        let second = rx.try_recv().unwrap();
        match (first, second) {
            (Event::InfoHashDiscovered { .. }, Event::InfoHashDiscovered { .. }) => {}
            _ => panic!("wrong variants"),
        }
    }
}
