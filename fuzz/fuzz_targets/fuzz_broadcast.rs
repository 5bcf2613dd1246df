//! Fuzz target for broadcast message handling.
//!
//! Arbitrary wire messages must never panic, and an identifier field inside
//! a payload must never leak into the entry's fields.

#![no_main]

use libfuzzer_sys::fuzz_target;
use realtime_replica::backend::BroadcastMessage;
use realtime_replica::broadcast::apply_broadcast;
use realtime_replica::{NoOpObserver, Replica};
use std::sync::Arc;

fuzz_target!(|data: &[u8]| {
    let Ok(messages) = serde_json::from_slice::<Vec<BroadcastMessage>>(data) else {
        return;
    };

    let replica = Replica::new("fuzz", Arc::new(NoOpObserver));
    for message in messages {
        apply_broadcast(&replica, "fuzz-mutate", "id", message);
    }

    assert!(replica.read().iter().all(|e| e.get("id").is_none()));
});
