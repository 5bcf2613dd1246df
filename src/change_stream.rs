//! Change-stream adapter: durable change notifications into the replica.
//!
//! One channel handle per table, created at construction and joined/left
//! by its [`ChannelGate`] as often as the engine needs.

use crate::backend::{ChangeEvent, ChangeHandler, ChangeKind, RealtimeTransport};
use crate::entry::{row_id, Entry};
use crate::lifecycle::ChannelGate;
use crate::observer::{EventSource, IntegrityWarning, SyncObserver};
use crate::replica::Replica;
use std::sync::Arc;
use tracing::{trace, warn};

/// Apply one durable change to `replica`.
///
/// Returns `true` if the replica changed. An event with no identifier in
/// either payload is reported and dropped.
pub fn apply_change(
    replica: &Replica,
    index_name: &str,
    observer: &dyn SyncObserver,
    event: ChangeEvent,
) -> bool {
    let Some(event_id) = event.id(index_name) else {
        let warning = IntegrityWarning::MissingIdentifier {
            source: EventSource::ChangeStream,
            index_name: index_name.to_string(),
        };
        warn!(table = %replica.table(), kind = ?event.kind, warning = %warning, "Dropping change event");
        observer.integrity_warning(replica.table(), &warning);
        return false;
    };
    trace!(table = %replica.table(), kind = ?event.kind, id = %event_id, "Change event");

    match event.kind {
        ChangeKind::Insert | ChangeKind::Update => {
            let Some(entry) = event.after.and_then(|row| Entry::from_row(row, index_name)) else {
                // Identifier only in the old row: nothing to insert or replace with.
                let warning = IntegrityWarning::MissingIdentifier {
                    source: EventSource::ChangeStream,
                    index_name: index_name.to_string(),
                };
                warn!(table = %replica.table(), id = %event_id, warning = %warning, "Change event has no new row");
                observer.integrity_warning(replica.table(), &warning);
                return false;
            };
            if event.kind == ChangeKind::Insert {
                replica.apply_insert(entry)
            } else {
                replica.apply_update(entry)
            }
        }
        ChangeKind::Delete => {
            // The old row is authoritative for deletes.
            let id = event
                .before
                .as_ref()
                .and_then(|row| row_id(row, index_name))
                .unwrap_or(event_id);
            replica.apply_delete(&id)
        }
    }
}

/// Durable change feed of one table.
pub struct ChangeStreamAdapter {
    gate: ChannelGate,
}

impl ChangeStreamAdapter {
    /// Create the channel handle and wire its events into `replica`.
    pub fn new<T>(
        transport: &T,
        channel_name: &str,
        table: &str,
        index_name: &str,
        replica: Arc<Replica>,
        observer: Arc<dyn SyncObserver>,
    ) -> Self
    where
        T: RealtimeTransport + ?Sized,
    {
        let index_name = index_name.to_string();
        let handler_observer = observer.clone();
        let handler: ChangeHandler = Arc::new(move |event| {
            apply_change(&replica, &index_name, handler_observer.as_ref(), event);
        });

        let channel = transport.subscribe_changes(channel_name, table, handler);
        Self {
            gate: ChannelGate::new(channel, observer),
        }
    }

    pub fn gate(&self) -> &ChannelGate {
        &self.gate
    }
}
