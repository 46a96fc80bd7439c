use tokio::sync::broadcast;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast of every committed change, in commit order. Feeds the admin live view
/// and cache invalidation. Slow subscribers lag and skip; committers never wait.
pub struct BookingFeed {
    tx: broadcast::Sender<Event>,
}

impl Default for BookingFeed {
    fn default() -> Self {
        Self::new()
    }
}

impl BookingFeed {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// No-op if nobody is listening.
    pub fn send(&self, event: &Event) {
        if self.tx.receiver_count() > 0 {
            let _ = self.tx.send(event.clone());
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
