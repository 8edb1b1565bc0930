//! UI-facing engine events and the fanout bus.
//!
//! Every engine instance owns one [`EventBus`]; subscribers receive the
//! committed changes with enough data to re-render without a roundtrip.
//! Delivery is best-effort and ordered per producer: a subscriber that
//! falls behind observes `Lagged` on its receiver instead of blocking
//! the producer.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::model::{LabelChange, PeerId, RouteChange};

/// Capacity of an engine's UI event channel.
const UI_CHANNEL_CAPACITY: usize = 512;

/// Lock state change as presented to the UI and client mirrors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockState {
    Unlocked,
    /// Held by this engine/client itself.
    OwnedBySelf,
    /// Held by some other connection.
    OwnedByOther,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockStateChange {
    pub dest: u32,
    pub state: LockState,
}

/// Events emitted by server and client engines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineEvent {
    ServerStarted { port: u16 },
    ServerStopped,
    ClientConnected { id: PeerId, addr: String },
    ClientDisconnected { id: PeerId },
    RoutingChanged(Vec<RouteChange>),
    LocksChanged(Vec<LockStateChange>),
    InputLabelsChanged(Vec<LabelChange>),
    OutputLabelsChanged(Vec<LabelChange>),
    LevelNamesChanged(Vec<LabelChange>),
    CommandReceived { id: PeerId, description: String },
    Error { message: String },
    RouterConnected,
    RouterDisconnected,
    RouterReconnecting { attempt: u32 },
}

/// Broadcast fanout for [`EngineEvent`].
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(UI_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Emit an event; subscribers that lag are degraded, not blocking.
    pub fn emit(&self, event: EngineEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_delivered_in_order() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.emit(EngineEvent::ServerStarted { port: 9990 });
        bus.emit(EngineEvent::ServerStopped);
        assert_eq!(rx.try_recv().unwrap(), EngineEvent::ServerStarted { port: 9990 });
        assert_eq!(rx.try_recv().unwrap(), EngineEvent::ServerStopped);
    }

    #[test]
    fn test_emit_without_subscribers_does_not_block() {
        let bus = EventBus::new();
        bus.emit(EngineEvent::ServerStopped);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_event_serialization() {
        let event = EngineEvent::RoutingChanged(vec![RouteChange { level: 0, dest: 3, src: 7 }]);
        let json = serde_json::to_string(&event).unwrap();
        let back: EngineEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(event, back);
    }
}
