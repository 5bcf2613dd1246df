//! Fuzz target for change event application.
//!
//! Feeds arbitrary JSON into the change feed handler and checks that the
//! replica never panics or holds two entries with one identifier.

#![no_main]

use libfuzzer_sys::fuzz_target;
use realtime_replica::backend::ChangeEvent;
use realtime_replica::change_stream::apply_change;
use realtime_replica::{Entry, EntryId, NoOpObserver, Replica};
use std::collections::HashSet;
use std::sync::Arc;

fuzz_target!(|data: &[u8]| {
    let Ok(events) = serde_json::from_slice::<Vec<ChangeEvent>>(data) else {
        return;
    };

    let replica = Replica::new("fuzz", Arc::new(NoOpObserver));
    for event in events {
        apply_change(&replica, "id", &NoOpObserver, event);
    }

    let snapshot = replica.read();
    let unique: HashSet<&EntryId> = snapshot.iter().map(Entry::id).collect();
    assert_eq!(unique.len(), snapshot.len());
});
