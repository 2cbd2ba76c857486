use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::model::CatalogEvent;

const CHANNEL_CAPACITY: usize = 256;

/// The channel admin clients LISTEN on for catalog changes.
pub const FIELDS_CHANNEL: &str = "fields";

/// Broadcast hub for LISTEN/NOTIFY, keyed by channel name.
pub struct NotifyHub {
    channels: DashMap<String, broadcast::Sender<CatalogEvent>>,
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

    /// Subscribe to a channel. Creates the channel if needed.
    pub fn subscribe(&self, channel: &str) -> broadcast::Receiver<CatalogEvent> {
        let sender = self
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send a notification. No-op if nobody is listening.
    pub fn send(&self, channel: &str, event: &CatalogEvent) {
        if let Some(sender) = self.channels.get(channel) {
            let _ = sender.send(event.clone());
        }
    }

    pub fn listener_count(&self, channel: &str) -> usize {
        self.channels
            .get(channel)
            .map(|s| s.receiver_count())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CatalogEventKind, Field};
    use ulid::Ulid;

    fn field() -> Field {
        Field {
            id: Ulid::new(),
            name: "Cancha 5".into(),
            surface_type: "grass".into(),
            price: 15_000,
            available_hours: vec![],
            image: String::new(),
            location: String::new(),
        }
    }

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let mut rx = hub.subscribe(FIELDS_CHANNEL);

        let event = CatalogEvent::field(CatalogEventKind::Created, &field(), 1);
        hub.send(FIELDS_CHANNEL, &event);

        let received = rx.recv().await.unwrap();
        assert_eq!(received, event);
    }

    #[tokio::test]
    async fn send_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        hub.send(FIELDS_CHANNEL, &CatalogEvent::ping(1));
        assert_eq!(hub.listener_count(FIELDS_CHANNEL), 0);
    }

    #[tokio::test]
    async fn channels_are_isolated() {
        let hub = NotifyHub::new();
        let mut fields = hub.subscribe(FIELDS_CHANNEL);
        let _other = hub.subscribe("other");
        assert_eq!(hub.listener_count(FIELDS_CHANNEL), 1);

        hub.send("other", &CatalogEvent::ping(5));
        assert!(fields.try_recv().is_err());
    }

    #[tokio::test]
    async fn every_listener_gets_a_copy() {
        let hub = NotifyHub::new();
        let mut a = hub.subscribe(FIELDS_CHANNEL);
        let mut b = hub.subscribe(FIELDS_CHANNEL);
        hub.send(FIELDS_CHANNEL, &CatalogEvent::ping(9));
        assert_eq!(a.recv().await.unwrap().at, 9);
        assert_eq!(b.recv().await.unwrap().at, 9);
    }
}
