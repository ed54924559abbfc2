//! Lifecycle event publication.
//!
//! # Responsibilities
//! - Define the named notifications the transport emits
//! - Provide the narrow publish capability components depend on
//! - Never fail or panic when nobody is subscribed
//!
//! # Design Decisions
//! - Components hold an injected `Arc<dyn EventSink>`, not a concrete bus
//! - The broadcast-backed `EventBus` drops events with no subscriber
//! - Payloads are cheap clones (connections are shared handles)

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::broadcast;

use crate::error::TransportError;
use crate::net::connection::Connection;

/// A named lifecycle notification.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A listener bound its server socket and is accepting.
    Listening { address: SocketAddr },

    /// A listener-level failure (bind error, fatal accept error).
    Error { error: Arc<TransportError> },

    /// A listener stopped; no further inbound connections until restarted.
    Closed,

    /// A connection was adapted, inbound or outbound.
    ConnectionOpened { connection: Connection },
}

impl TransportEvent {
    /// The wire-level event name.
    pub fn name(&self) -> &'static str {
        match self {
            TransportEvent::Listening { .. } => "listening",
            TransportEvent::Error { .. } => "error",
            TransportEvent::Closed => "close",
            TransportEvent::ConnectionOpened { .. } => "connection:open",
        }
    }
}

/// Publish capability consumed by the transport components.
///
/// Implementations must not fail when no subscriber is registered.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: TransportEvent);
}

/// Broadcast-backed event bus for observers.
#[derive(Debug)]
pub struct EventBus {
    tx: broadcast::Sender<TransportEvent>,
}

impl EventBus {
    /// Create a bus buffering up to `capacity` undelivered events per
    /// subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribe to all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(64)
    }
}

impl EventSink for EventBus {
    fn publish(&self, event: TransportEvent) {
        // send fails only when no subscriber exists, which is fine.
        let _ = self.tx.send(event);
    }
}

/// Sink that discards every event.
#[derive(Debug, Default)]
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn publish(&self, _event: TransportEvent) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_without_subscriber_is_a_noop() {
        let bus = EventBus::default();
        bus.publish(TransportEvent::Closed);
    }

    #[tokio::test]
    async fn subscriber_receives_events() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        bus.publish(TransportEvent::Listening {
            address: "127.0.0.1:3000".parse().unwrap(),
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.name(), "listening");
    }
}
