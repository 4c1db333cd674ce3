use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// Per-salon broadcast of committed events. Read paths (dashboards,
/// calendar views) subscribe to learn when cached derivations of a
/// salon's schedule are stale. Dropping a message only delays a
/// recompute, so lagging receivers are acceptable.
pub struct InvalidationHub {
    channels: DashMap<Ulid, broadcast::Sender<Event>>,
}

impl Default for InvalidationHub {
    fn default() -> Self {
        Self::new()
    }
}

impl InvalidationHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to a salon's invalidation stream, creating it if needed.
    pub fn subscribe(&self, salon_id: Ulid) -> broadcast::Receiver<Event> {
        self.channels
            .entry(salon_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Publish a committed event. No-op when nobody listens.
    pub fn publish(&self, salon_id: Ulid, event: &Event) {
        if let Some(sender) = self.channels.get(&salon_id) {
            let _ = sender.send(event.clone());
        }
    }

    pub fn remove(&self, salon_id: &Ulid) {
        self.channels.remove(salon_id);
    }
}
