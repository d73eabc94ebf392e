use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast hub for LISTEN/NOTIFY per spot. Every committed mutation on a
/// spot is published here; lot/user registry events carry no spot channel.
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

    /// Subscribe to notifications for a spot. Creates the channel if needed.
    pub fn subscribe(&self, spot_id: Ulid) -> broadcast::Receiver<Event> {
        let sender = self
            .channels
            .entry(spot_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send a notification. No-op if nobody is listening.
    pub fn send(&self, spot_id: Ulid, event: &Event) {
        if let Some(sender) = self.channels.get(&spot_id) {
            let _ = sender.send(event.clone());
        }
    }

    /// Remove a channel (e.g. when a spot is deleted).
    pub fn remove(&self, spot_id: &Ulid) {
        self.channels.remove(spot_id);
    }

    /// Wire payload for a notification. Event variants serialize as
    /// single-key JSON objects, so clients can dispatch on the variant name.
    pub fn payload(event: &Event) -> String {
        serde_json::to_string(event).unwrap_or_else(|_| "{}".into())
    }
}
