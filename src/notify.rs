use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast hub for per-spot event subscriptions (the engine-level side
/// of LISTEN). Occupancy boards and tests subscribe here; booking and
/// spot-deletion events are published as they are applied.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Event>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to events for one spot. Creates the channel if needed.
    pub fn subscribe(&self, spot_id: Ulid) -> broadcast::Receiver<Event> {
        let sender = self
            .channels
            .entry(spot_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Publish an event. No-op if nobody is listening.
    pub fn send(&self, spot_id: Ulid, event: &Event) {
        if let Some(sender) = self.channels.get(&spot_id) {
            let _ = sender.send(event.clone());
        }
    }

    /// Drop a spot's channel (spot deleted).
    pub fn remove(&self, spot_id: &Ulid) {
        self.channels.remove(spot_id);
    }
}
