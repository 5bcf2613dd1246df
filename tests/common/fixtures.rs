//! Row and engine helpers over the in-memory backend.

use super::RecordingObserver;
use realtime_replica::{
    EntryId, MemoryBackend, ReplicaConfig, ReplicaHooks, Row, SendRetryConfig, Snapshot,
    TableReplica,
};
use serde_json::Value;
use std::sync::Arc;

/// Build a row from a JSON object literal.
pub fn row(value: Value) -> Row {
    match value {
        Value::Object(map) => map,
        other => panic!("expected a JSON object, got {}", other),
    }
}

/// Identifiers of a snapshot, in order.
pub fn ids(snapshot: &Snapshot) -> Vec<EntryId> {
    snapshot.iter().map(|e| e.id().clone()).collect()
}

/// `(id, field)` pairs of a snapshot, in order.
pub fn field_values(snapshot: &Snapshot, field: &str) -> Vec<(EntryId, Value)> {
    snapshot
        .iter()
        .map(|e| (e.id().clone(), e.get(field).cloned().unwrap_or(Value::Null)))
        .collect()
}

pub fn config(table: &str, write_interval_ms: i64) -> ReplicaConfig {
    ReplicaConfig {
        write_interval_ms,
        ..ReplicaConfig::for_testing(table)
    }
}

/// One client of `backend` with a recording observer.
pub struct Client {
    pub engine: TableReplica<MemoryBackend>,
    pub observer: Arc<RecordingObserver>,
}

impl Client {
    pub fn new(backend: &Arc<MemoryBackend>, config: ReplicaConfig) -> Self {
        let observer = Arc::new(RecordingObserver::default());
        let engine = TableReplica::with_hooks(
            backend.clone(),
            config,
            ReplicaHooks::default().with_observer(observer.clone()),
        )
        .expect("valid config");
        Self { engine, observer }
    }

    /// A client whose broadcasts give up after three quick attempts.
    pub fn fast_retry(backend: &Arc<MemoryBackend>, table: &str, write_interval_ms: i64) -> Self {
        let config = ReplicaConfig {
            send_retry: SendRetryConfig::testing(),
            ..config(table, write_interval_ms)
        };
        Self::new(backend, config)
    }
}

/// A backend with `todos` seeded as `[{id: 1, name: "a"}]`.
pub fn seeded_backend() -> Arc<MemoryBackend> {
    let backend = Arc::new(MemoryBackend::new());
    backend.seed("todos", vec![row(serde_json::json!({"id": 1, "name": "a"}))]);
    backend
}
