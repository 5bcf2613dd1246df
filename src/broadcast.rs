//! Broadcast adapter: peer add/remove/mutate messages.
//!
//! The channel echoes our own sends back to us, so local and remote origin
//! share one inbound path. Outbound sends go through
//! [`send_with_retry`](crate::resilience::send_with_retry).

use crate::backend::{BroadcastHandler, BroadcastKind, BroadcastMessage, RealtimeTransport};
use crate::config::SendRetryConfig;
use crate::entry::{strip_id, Entry, EntryId, Row};
use crate::lifecycle::{ChannelGate, ReadyCallback};
use crate::observer::SyncObserver;
use crate::replica::Replica;
use crate::resilience::{send_with_retry, Delivery};
use std::sync::Arc;
use tracing::trace;

/// Apply one broadcast message to `replica`.
///
/// Messages for other event names are ignored. Returns `true` if the
/// replica changed.
pub fn apply_broadcast(replica: &Replica, event: &str, index_name: &str, mut message: BroadcastMessage) -> bool {
    if message.event != event {
        trace!(table = %replica.table(), event = %message.event, "Ignoring broadcast for another event");
        return false;
    }
    // The identifier travels outside the payload.
    strip_id(&mut message.payload, index_name);

    match message.kind {
        BroadcastKind::Add => replica.apply_insert(Entry::new(message.id, message.payload)),
        BroadcastKind::Remove => replica.apply_delete(&message.id),
        BroadcastKind::Mutate => replica.apply_merge(&message.id, &message.payload),
    }
}

/// Ephemeral peer channel of one table or shared set.
pub struct BroadcastAdapter {
    gate: ChannelGate,
    event: String,
    index_name: String,
    retry: SendRetryConfig,
    observer: Arc<dyn SyncObserver>,
}

impl BroadcastAdapter {
    /// Create the self-echoing channel handle and wire it into `replica`.
    #[allow(clippy::too_many_arguments)]
    pub fn new<T>(
        transport: &T,
        channel_name: &str,
        event: &str,
        index_name: &str,
        retry: SendRetryConfig,
        replica: Arc<Replica>,
        observer: Arc<dyn SyncObserver>,
        on_ready: Option<ReadyCallback>,
    ) -> Self
    where
        T: RealtimeTransport + ?Sized,
    {
        let handler_event = event.to_string();
        let handler_index = index_name.to_string();
        let handler: BroadcastHandler = Arc::new(move |message| {
            apply_broadcast(&replica, &handler_event, &handler_index, message);
        });

        let channel = transport.broadcast_channel(channel_name, true, handler);
        Self {
            gate: ChannelGate::new(channel, observer.clone()).with_ready_callback(on_ready),
            event: event.to_string(),
            index_name: index_name.to_string(),
            retry,
            observer,
        }
    }

    pub fn gate(&self) -> &ChannelGate {
        &self.gate
    }

    pub fn is_joined(&self) -> bool {
        self.gate.is_joined()
    }

    pub fn event(&self) -> &str {
        &self.event
    }

    /// Announce a new entry. The payload is the full row, identifier included.
    pub async fn send_add(&self, entry: &Entry) -> Delivery {
        self.send(BroadcastKind::Add, entry.id().clone(), entry.to_row(&self.index_name))
            .await
    }

    pub async fn send_remove(&self, id: EntryId) -> Delivery {
        self.send(BroadcastKind::Remove, id, Row::new()).await
    }

    pub async fn send_mutate(&self, id: EntryId, patch: Row) -> Delivery {
        self.send(BroadcastKind::Mutate, id, patch).await
    }

    async fn send(&self, kind: BroadcastKind, id: EntryId, payload: Row) -> Delivery {
        let message = BroadcastMessage {
            event: self.event.clone(),
            kind,
            id,
            payload,
        };
        trace!(channel = %self.gate.name(), kind = %kind, id = %message.id, "Broadcasting");

        let delivery = send_with_retry(self.gate.channel().as_ref(), message, &self.retry).await;
        self.observer.broadcast_delivery(self.gate.name(), &delivery);
        delivery
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBackend;
    use crate::observer::testing::RecordingObserver;
    use serde_json::json;

    fn row(value: serde_json::Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    fn message(kind: BroadcastKind, id: i64, payload: serde_json::Value) -> BroadcastMessage {
        BroadcastMessage {
            event: "todos-mutate".to_string(),
            kind,
            id: EntryId::Int(id),
            payload: row(payload),
        }
    }

    fn replica() -> (Replica, Arc<RecordingObserver>) {
        let observer = Arc::new(RecordingObserver::default());
        let replica = Replica::new("todos", observer.clone());
        replica.load(vec![Entry::new(1, row(json!({"name": "a", "done": false})))]);
        (replica, observer)
    }

    #[test]
    fn test_add_is_idempotent() {
        let (replica, _) = replica();
        let add = message(BroadcastKind::Add, 2, json!({"name": "b"}));
        assert!(apply_broadcast(&replica, "todos-mutate", "id", add.clone()));
        assert!(!apply_broadcast(&replica, "todos-mutate", "id", add));
        assert_eq!(replica.len(), 2);
    }

    #[test]
    fn test_remove() {
        let (replica, _) = replica();
        assert!(apply_broadcast(&replica, "todos-mutate", "id", message(BroadcastKind::Remove, 1, json!({}))));
        assert!(replica.is_empty());
    }

    #[test]
    fn test_mutate_merges_fields() {
        let (replica, _) = replica();
        let mutate = message(BroadcastKind::Mutate, 1, json!({"done": true}));
        assert!(apply_broadcast(&replica, "todos-mutate", "id", mutate));

        let entry = replica.get(&EntryId::Int(1)).unwrap();
        assert_eq!(entry.get("name"), Some(&json!("a")));
        assert_eq!(entry.get("done"), Some(&json!(true)));
    }

    #[test]
    fn test_mutate_unknown_identifier_warns() {
        let (replica, observer) = replica();
        let before = replica.read();
        assert!(!apply_broadcast(&replica, "todos-mutate", "id", message(BroadcastKind::Mutate, 5, json!({"x": 1}))));
        assert_eq!(replica.read(), before);
        assert_eq!(observer.warning_count(), 1);
    }

    #[test]
    fn test_other_events_ignored() {
        let (replica, _) = replica();
        let mut msg = message(BroadcastKind::Remove, 1, json!({}));
        msg.event = "other-mutate".to_string();
        assert!(!apply_broadcast(&replica, "todos-mutate", "id", msg));
        assert_eq!(replica.len(), 1);
    }

    #[test]
    fn test_identifier_in_payload_cannot_rewrite_id() {
        let (replica, _) = replica();
        let mutate = message(BroadcastKind::Mutate, 1, json!({"id": 99, "name": "z"}));
        assert!(apply_broadcast(&replica, "todos-mutate", "id", mutate));

        let entry = replica.get(&EntryId::Int(1)).unwrap();
        assert!(entry.get("id").is_none());
        assert_eq!(entry.get("name"), Some(&json!("z")));
    }

    #[tokio::test]
    async fn test_self_echo_applies_own_sends() {
        let backend = MemoryBackend::new();
        let observer = Arc::new(RecordingObserver::default());
        let replica = Arc::new(Replica::new("todos", observer.clone()));
        let adapter = BroadcastAdapter::new(
            &backend,
            "todos-broadcast-changes",
            "todos-mutate",
            "id",
            SendRetryConfig::testing(),
            replica.clone(),
            observer.clone(),
            None,
        );
        adapter.gate().ensure_joined().await.unwrap();

        let entry = Entry::new(7, row(json!({"name": "seven"})));
        let delivery = adapter.send_add(&entry).await;
        assert!(delivery.is_delivered());
        assert_eq!(replica.get(&EntryId::Int(7)), Some(entry));

        let delivery = adapter.send_mutate(EntryId::Int(7), row(json!({"name": "7"}))).await;
        assert_eq!(delivery.attempts, 1);
        assert_eq!(replica.get(&EntryId::Int(7)).unwrap().get("name"), Some(&json!("7")));

        adapter.send_remove(EntryId::Int(7)).await;
        assert!(replica.is_empty());
        assert_eq!(observer.deliveries.lock().len(), 3);
    }

    #[tokio::test]
    async fn test_add_payload_carries_identifier() {
        use parking_lot::Mutex;

        let backend = MemoryBackend::new();
        let observer = Arc::new(RecordingObserver::default());
        let replica = Arc::new(Replica::new("cursors", observer.clone()));
        let adapter = BroadcastAdapter::new(
            &backend,
            "cursors-broadcast-changes",
            "cursors-broadcast",
            "uuid",
            SendRetryConfig::testing(),
            replica.clone(),
            observer,
            None,
        );
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let peer = backend.broadcast_channel(
            "cursors-broadcast-changes",
            false,
            Arc::new(move |message: BroadcastMessage| sink.lock().push(message)),
        );
        peer.join().await;
        adapter.gate().ensure_joined().await.unwrap();

        let entry = Entry::new("u-1", row(json!({"x": 3})));
        adapter.send_add(&entry).await;

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].payload, row(json!({"uuid": "u-1", "x": 3})));
        // the local echo keeps the identifier out of the fields
        assert_eq!(replica.get(&EntryId::from("u-1")), Some(entry));
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_before_join_exhausts_retries() {
        let backend = MemoryBackend::new();
        let observer = Arc::new(RecordingObserver::default());
        let replica = Arc::new(Replica::new("todos", observer.clone()));
        let adapter = BroadcastAdapter::new(
            &backend,
            "todos-broadcast-changes",
            "todos-mutate",
            "id",
            SendRetryConfig::testing(),
            replica.clone(),
            observer.clone(),
            None,
        );

        let delivery = adapter.send_remove(EntryId::Int(1)).await;
        assert!(!delivery.is_delivered());
        assert_eq!(delivery.attempts, 3);
        assert!(!adapter.is_joined());
    }
}
