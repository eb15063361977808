use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// Render the NOTIFY payload for an event. Subscribers get a JSON document
/// describing the change, channel = resource id.
fn payload_for(event: &Event) -> String {
    let value = match event {
        Event::BlockCreated { id, span, reason, booking_ref, .. } => serde_json::json!({
            "op": "block_created",
            "id": id.to_string(),
            "start": span.start,
            "end": span.end,
            "reason": reason.as_str(),
            "booking_ref": booking_ref.map(|b| b.to_string()),
        }),
        Event::BlockUpdated { id, span, reason, .. } => serde_json::json!({
            "op": "block_updated",
            "id": id.to_string(),
            "start": span.start,
            "end": span.end,
            "reason": reason.as_str(),
        }),
        Event::BlockDeleted { id, .. } => serde_json::json!({
            "op": "block_deleted",
            "id": id.to_string(),
        }),
        Event::BookingReleased { booking_ref } => serde_json::json!({
            "op": "booking_released",
            "booking_ref": booking_ref.to_string(),
        }),
    };
    value.to_string()
}

/// Broadcast hub for LISTEN/NOTIFY per resource.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<String>>,
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to change notifications for a resource. Creates the channel if needed.
    pub fn subscribe(&self, resource_id: Ulid) -> broadcast::Receiver<String> {
        let sender = self
            .channels
            .entry(resource_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send a notification. No-op if nobody is listening.
    pub fn send(&self, resource_id: Ulid, event: &Event) {
        if let Some(sender) = self.channels.get(&resource_id) {
            let _ = sender.send(payload_for(event));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BlockReason, Span};

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let rid = Ulid::new();
        let mut rx = hub.subscribe(rid);

        let id = Ulid::new();
        let event = Event::BlockCreated {
            id,
            resource_id: rid,
            span: Span::new(1000, 2000),
            reason: BlockReason::Manual,
            booking_ref: None,
            notes: None,
            created_at: 5,
            updated_at: 5,
        };
        hub.send(rid, &event);

        let payload = rx.recv().await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(value["op"], "block_created");
        assert_eq!(value["id"], id.to_string());
        assert_eq!(value["start"], 1000);
        assert_eq!(value["end"], 2000);
        assert_eq!(value["reason"], "manual");
        assert!(value["booking_ref"].is_null());
    }

    #[tokio::test]
    async fn booking_release_payload() {
        let hub = NotifyHub::new();
        let rid = Ulid::new();
        let mut rx = hub.subscribe(rid);

        let bref = Ulid::new();
        hub.send(rid, &Event::BookingReleased { booking_ref: bref });

        let payload = rx.recv().await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(value["op"], "booking_released");
        assert_eq!(value["booking_ref"], bref.to_string());
    }

    #[tokio::test]
    async fn send_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        let rid = Ulid::new();
        // No subscriber — should not panic
        hub.send(
            rid,
            &Event::BlockDeleted { id: Ulid::new(), resource_id: rid },
        );
    }
}
