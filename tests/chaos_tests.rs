// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Chaos tests: simulate failures and verify graceful degradation.
//!
//! These tests verify the engine handles store, transport and data faults
//! without panics, deadlocks or lost writes.
//!
//! Run with: cargo test --test chaos_tests -- --nocapture

mod common;

use common::{config, ids, row, seeded_backend, Client};
use realtime_replica::backend::{BroadcastKind, BroadcastMessage, ChangeEvent};
use realtime_replica::memory::JournalOp;
use realtime_replica::{
    EntryId, GateState, MemoryBackend, MutateOutcome, ReplicaError, SendRetryConfig, SharedSet,
    SharedSetConfig,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

// =============================================================================
// Store Failures
// =============================================================================

/// Test: A failed flush keeps the write pending until the store recovers
#[tokio::test(start_paused = true)]
async fn failed_flush_is_retried_by_next_flush() {
    let backend = seeded_backend();
    let client = Client::new(&backend, config("todos", 500));
    client.engine.acquire().await.unwrap();
    client.engine.mutate(1, row(json!({"name": "x"}))).await.unwrap();
    client.engine.mutate(1, row(json!({"name": "y"}))).await.unwrap();

    backend.fail_writes(true);
    let failed = client.engine.flush().await;
    assert_eq!(failed.failed, 1);
    assert!(!failed.is_success());
    assert_eq!(client.engine.pending_writes(), vec![EntryId::Int(1)]);

    backend.fail_writes(false);
    let recovered = client.engine.flush().await;
    assert_eq!(recovered.persisted, 1);
    assert!(client.engine.pending_writes().is_empty());
    assert_eq!(
        backend.row("todos", &EntryId::Int(1)),
        Some(row(json!({"id": 1, "name": "y"})))
    );
}

/// Test: Write-through failures surface to the caller and leave the replica alone
#[tokio::test]
async fn write_through_failure_is_returned() {
    let backend = seeded_backend();
    let client = Client::new(&backend, config("todos", 0));
    client.engine.acquire().await.unwrap();
    let before = client.engine.snapshot();

    backend.fail_writes(true);
    let mutate = client.engine.mutate(1, row(json!({"name": "x"}))).await;
    let add = client.engine.add(row(json!({"name": "b"}))).await;
    let remove = client.engine.remove(1).await;

    for result in [mutate.map(|_| ()), add, remove] {
        let err = result.unwrap_err();
        assert!(matches!(err, ReplicaError::Transport { .. }));
        assert!(err.is_retryable());
    }
    assert_eq!(client.engine.snapshot(), before);
}

/// Test: A failed initial load can be retried by the next acquire
#[tokio::test]
async fn failed_load_recovers_on_next_acquire() {
    let backend = seeded_backend();
    let client = Client::new(&backend, config("todos", 0));

    backend.fail_queries(true);
    assert!(client.engine.acquire().await.is_err());
    assert_eq!(client.engine.subscriber_count(), 0);
    assert!(client.engine.channel_states().all_closed());

    backend.fail_queries(false);
    let rx = client.engine.acquire().await.unwrap();
    assert_eq!(rx.borrow().len(), 1);
    assert!(client.engine.channel_states().all_joined());
}

// =============================================================================
// Transport Failures
// =============================================================================

/// Test: Broadcast retries run out without failing the mutation
#[tokio::test(start_paused = true)]
async fn exhausted_broadcast_still_buffers() {
    let backend = seeded_backend();
    let client = Client::fast_retry(&backend, "todos", 500);
    client.engine.acquire().await.unwrap();
    client.engine.mutate(1, row(json!({"name": "x"}))).await.unwrap();

    backend.fail_sends(u32::MAX);
    let outcome = client.engine.mutate(1, row(json!({"name": "y"}))).await.unwrap();

    assert_eq!(outcome, MutateOutcome::Buffered { delivered: false });
    let delivery = client.observer.deliveries().pop().unwrap();
    assert_eq!(delivery.attempts, 3);
    assert!(!delivery.is_delivered());

    // the local value survives and is persisted later
    backend.fail_sends(0);
    client.engine.flush().await;
    assert_eq!(
        backend.row("todos", &EntryId::Int(1)),
        Some(row(json!({"id": 1, "name": "y"})))
    );
}

/// Test: Transient send failures are absorbed by retries
#[tokio::test(start_paused = true)]
async fn transient_send_failures_are_retried() {
    let backend = seeded_backend();
    let alice = Client::new(&backend, config("todos", 500));
    let bob = Client::new(&backend, config("todos", 500));
    alice.engine.acquire().await.unwrap();
    bob.engine.acquire().await.unwrap();
    alice.engine.mutate(1, row(json!({"name": "x"}))).await.unwrap();

    backend.fail_sends(2);
    let outcome = alice.engine.mutate(1, row(json!({"name": "y"}))).await.unwrap();

    assert_eq!(outcome, MutateOutcome::Buffered { delivered: true });
    assert_eq!(alice.observer.deliveries().pop().unwrap().attempts, 3);
    assert_eq!(
        bob.engine.get(&EntryId::Int(1)).unwrap().get("name"),
        Some(&json!("y"))
    );
}

/// Test: A rejected leave keeps the channel joined and usable
#[tokio::test(start_paused = true)]
async fn failed_leave_keeps_channel_joined() {
    let backend = seeded_backend();
    let client = Client::new(&backend, config("todos", 0));
    client.engine.acquire().await.unwrap();

    backend.fail_leave(true);
    assert!(client.engine.release().await.is_err());
    let states = client.engine.channel_states();
    assert_eq!(states.changes, GateState::Joined);
    assert_eq!(states.broadcast, GateState::Joined);

    // still receiving changes
    backend.push_change("todos", ChangeEvent::insert(row(json!({"id": 2}))));
    assert_eq!(ids(&client.engine.snapshot()), vec![EntryId::Int(1), EntryId::Int(2)]);

    // the subscription survived, so the release can be retried
    assert_eq!(client.engine.subscriber_count(), 1);
    backend.fail_leave(false);
    client.engine.release().await.unwrap();
    assert!(client.engine.channel_states().all_closed());
    assert_eq!(backend.join_count("todos-table-changes"), 1);
}

/// Test: Release while the store rejects writes keeps buffered values
#[tokio::test(start_paused = true)]
async fn release_during_write_outage_keeps_pending_writes() {
    let backend = seeded_backend();
    let client = Client::new(&backend, config("todos", 500));
    client.engine.acquire().await.unwrap();
    client.engine.mutate(1, row(json!({"name": "x"}))).await.unwrap();
    client.engine.mutate(1, row(json!({"name": "y"}))).await.unwrap();

    backend.fail_writes(true);
    let err = client.engine.release().await.unwrap_err();

    assert!(matches!(err, ReplicaError::Unflushed { .. }));
    assert!(err.is_retryable());
    assert_eq!(client.engine.pending_writes(), vec![EntryId::Int(1)]);
    assert!(client.engine.channel_states().all_joined());
    assert_eq!(
        backend.row("todos", &EntryId::Int(1)),
        Some(row(json!({"id": 1, "name": "x"})))
    );

    backend.fail_writes(false);
    client.engine.release().await.unwrap();
    assert!(client.engine.pending_writes().is_empty());
    assert!(client.engine.channel_states().all_closed());
    assert_eq!(
        backend.row("todos", &EntryId::Int(1)),
        Some(row(json!({"id": 1, "name": "y"})))
    );
}

/// Test: A timed-out acquire leaves nothing half-joined
#[tokio::test(start_paused = true)]
async fn timed_out_acquire_can_be_retried() {
    let backend = seeded_backend();
    backend.set_latency(Duration::from_millis(100));
    let client = Client::new(&backend, config("todos", 0));

    let timed_out = tokio::time::timeout(Duration::from_millis(50), client.engine.acquire()).await;
    assert!(timed_out.is_err());
    assert_eq!(client.engine.subscriber_count(), 0);
    assert!(client.engine.channel_states().all_closed());

    let rx = client.engine.acquire().await.unwrap();
    assert_eq!(rx.borrow().len(), 1);
    assert_eq!(client.engine.subscriber_count(), 1);
    assert_eq!(backend.join_count("todos-table-changes"), 1);
    assert_eq!(backend.join_count("todos-broadcast-changes"), 1);

    client.engine.release().await.unwrap();
    assert!(client.engine.channel_states().all_closed());
    assert_eq!(backend.leave_count("todos-table-changes"), 1);
    assert_eq!(backend.leave_count("todos-broadcast-changes"), 1);

    // both interrupted handshakes were reported as resets to closed
    let states = client.observer.states_of("todos-table-changes");
    assert_eq!(&states[..2], &[GateState::Joining, GateState::Closed]);
}

/// Test: Shared set writes fail loudly when every attempt is lost
#[tokio::test(start_paused = true)]
async fn shared_set_reports_lost_broadcasts() {
    let backend = Arc::new(MemoryBackend::new());
    let config = SharedSetConfig {
        send_retry: SendRetryConfig::testing(),
        ..SharedSetConfig::new("presence")
    };
    let set = SharedSet::new(backend.clone(), config, Vec::new()).unwrap();
    set.acquire().await.unwrap();

    backend.fail_sends(u32::MAX);
    let err = set.add(row(json!({"user": "ada"}))).await.unwrap_err();

    assert!(matches!(err, ReplicaError::Delivery { attempts: 3, .. }));
    assert!(set.snapshot().is_empty());
}

// =============================================================================
// Malformed Data
// =============================================================================

/// Test: Malformed change events are skipped without stopping the feed
#[tokio::test]
async fn malformed_change_events_no_panic() {
    let backend = seeded_backend();
    let client = Client::new(&backend, config("todos", 0));
    client.engine.acquire().await.unwrap();

    let malformed = [
        ChangeEvent::insert(row(json!({}))),
        ChangeEvent::insert(row(json!({"id": null}))),
        ChangeEvent::insert(row(json!({"id": [1, 2]}))),
        ChangeEvent::insert(row(json!({"id": {"nested": true}}))),
        ChangeEvent::insert(row(json!({"id": 1.5}))),
        ChangeEvent::update(None, row(json!({"name": "no id"}))),
        ChangeEvent::delete(row(json!({}))),
    ];
    for event in malformed {
        backend.push_change("todos", event);
    }
    backend.push_change("todos", ChangeEvent::insert(row(json!({"id": 2, "name": "b"}))));

    assert_eq!(ids(&client.engine.snapshot()), vec![EntryId::Int(1), EntryId::Int(2)]);
    assert_eq!(client.observer.warning_count(), 7);
}

/// Test: Broadcasts naming unknown entries or other events are harmless
#[tokio::test]
async fn stray_broadcasts_no_panic() {
    let backend = seeded_backend();
    let client = Client::new(&backend, config("todos", 0));
    client.engine.acquire().await.unwrap();
    let before = client.engine.snapshot();

    let stray = [
        ("todos-mutate", BroadcastKind::Mutate, EntryId::Int(404)),
        ("todos-mutate", BroadcastKind::Remove, EntryId::Int(404)),
        ("something-else", BroadcastKind::Add, EntryId::Int(3)),
    ];
    for (event, kind, id) in stray {
        backend.push_broadcast(
            "todos-broadcast-changes",
            BroadcastMessage {
                event: event.to_string(),
                kind,
                id,
                payload: row(json!({"name": "stray"})),
            },
        );
    }

    assert_eq!(client.engine.snapshot(), before);
    // only the mutate of an unknown entry is an integrity problem
    assert_eq!(client.observer.warning_count(), 1);
}

// =============================================================================
// Concurrency Under Latency
// =============================================================================

/// Test: Interleaved acquire/release cycles settle without deadlock
#[tokio::test(start_paused = true)]
async fn acquire_release_churn_settles() {
    let backend = seeded_backend();
    backend.set_latency(Duration::from_millis(5));
    let client = Arc::new(Client::new(&backend, config("todos", 200)));

    let mut handles = Vec::new();
    for i in 0..8u64 {
        let client = client.clone();
        handles.push(tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(i * 3)).await;
            client.engine.acquire().await.unwrap();
            let _ = client.engine.mutate(1, row(json!({"n": i}))).await;
            tokio::time::sleep(Duration::from_millis(7)).await;
            client.engine.release().await.unwrap();
        }));
    }

    let all = futures::future::join_all(handles);
    tokio::time::timeout(Duration::from_secs(30), all)
        .await
        .expect("acquire/release churn deadlocked")
        .into_iter()
        .for_each(|r| r.unwrap());

    assert_eq!(client.engine.subscriber_count(), 0);
    assert!(client.engine.channel_states().all_closed());
    assert!(client.engine.pending_writes().is_empty());

    // every join was matched by a leave
    let journal = backend.journal();
    let joins = journal.iter().filter(|op| matches!(op, JournalOp::Join { .. })).count();
    let leaves = journal.iter().filter(|op| matches!(op, JournalOp::Leave { .. })).count();
    assert_eq!(joins, leaves);
}

/// Test: Concurrent buffered mutations all end up persisted
#[tokio::test(start_paused = true)]
async fn concurrent_mutations_lose_nothing() {
    let backend = seeded_backend();
    backend.seed("todos", vec![row(json!({"id": 2, "name": "b"}))]);
    backend.set_latency(Duration::from_millis(2));
    let client = Arc::new(Client::new(&backend, config("todos", 1_000)));
    client.engine.acquire().await.unwrap();

    let tasks = (0..20).map(|i| {
        let client = client.clone();
        async move {
            let id = if i % 2 == 0 { 1 } else { 2 };
            client.engine.mutate(id, row(json!({"last": i}))).await.unwrap();
        }
    });
    futures::future::join_all(tasks).await;

    client.engine.release().await.unwrap();

    assert!(client.engine.pending_writes().is_empty());
    for id in [1, 2] {
        let local = client.engine.get(&EntryId::Int(id)).unwrap();
        let stored = backend.row("todos", &EntryId::Int(id)).unwrap();
        assert_eq!(stored.get("last"), local.get("last"));
    }
}
