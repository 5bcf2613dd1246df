//! The in-memory replica: single source of truth for readers.
//!
//! Entries are published as immutable snapshots (`Arc<Vec<Entry>>`) over a
//! `tokio::sync::watch` channel. Every apply computes a new vector from the
//! current one and swaps it in while holding the channel's write lock, so a
//! reader either sees the snapshot before an apply or after it, never a
//! half-applied one.
//!
//! # Invariant
//!
//! At most one entry per identifier, after every operation.
//!
//! # Anomalies
//!
//! Updates and merges for unknown identifiers leave the replica unchanged
//! and emit exactly one [`IntegrityWarning`] each.

use crate::entry::{Entry, EntryId, Row};
use crate::observer::{IntegrityWarning, SyncObserver, TargetedOp};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, trace, warn};

/// An immutable view of the replica.
pub type Snapshot = Arc<Vec<Entry>>;

/// Ordered, identifier-unique collection of entries.
pub struct Replica {
    /// Table or set name (for logging).
    table: String,
    tx: watch::Sender<Snapshot>,
    observer: Arc<dyn SyncObserver>,
}

impl Replica {
    /// Create an empty replica.
    pub fn new(table: impl Into<String>, observer: Arc<dyn SyncObserver>) -> Self {
        let (tx, _rx) = watch::channel(Arc::new(Vec::new()));
        Self {
            table: table.into(),
            tx,
            observer,
        }
    }

    /// Create a replica pre-populated with `entries` (deduplicated).
    pub fn with_entries(
        table: impl Into<String>,
        observer: Arc<dyn SyncObserver>,
        entries: Vec<Entry>,
    ) -> Self {
        let replica = Self::new(table, observer);
        replica.load(entries);
        replica
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Current snapshot.
    pub fn read(&self) -> Snapshot {
        self.tx.borrow().clone()
    }

    /// A receiver that is notified on every published snapshot.
    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.tx.subscribe()
    }

    pub fn len(&self) -> usize {
        self.tx.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.borrow().is_empty()
    }

    /// Current value of one entry.
    pub fn get(&self, id: &EntryId) -> Option<Entry> {
        self.tx.borrow().iter().find(|e| e.id() == id).cloned()
    }

    pub fn contains(&self, id: &EntryId) -> bool {
        self.tx.borrow().iter().any(|e| e.id() == id)
    }

    /// Replace the whole replica with an initial read.
    ///
    /// Duplicate identifiers keep their first occurrence. Returns the number
    /// of entries kept.
    pub fn load(&self, entries: Vec<Entry>) -> usize {
        let mut seen = HashSet::with_capacity(entries.len());
        let mut next = Vec::with_capacity(entries.len());
        for entry in entries {
            if seen.insert(entry.id().clone()) {
                next.push(entry);
            } else {
                debug!(table = %self.table, id = %entry.id(), "Dropping duplicate row from initial load");
            }
        }
        let kept = next.len();
        self.tx.send_replace(Arc::new(next));
        kept
    }

    /// Append `entry` unless its identifier is already present.
    ///
    /// Returns `true` if the replica changed.
    pub fn apply_insert(&self, entry: Entry) -> bool {
        let changed = self.publish(|current| {
            if current.iter().any(|e| e.id() == entry.id()) {
                return None;
            }
            let mut next = Vec::with_capacity(current.len() + 1);
            next.extend_from_slice(current);
            next.push(entry.clone());
            Some(next)
        });
        if changed {
            trace!(table = %self.table, id = %entry.id(), "Applied insert");
        } else {
            trace!(table = %self.table, id = %entry.id(), "Insert for existing identifier ignored");
        }
        changed
    }

    /// Replace the entry with the same identifier.
    ///
    /// Unknown identifiers are a no-op plus one integrity warning.
    pub fn apply_update(&self, entry: Entry) -> bool {
        let id = entry.id().clone();
        let changed = self.publish(|current| {
            let index = current.iter().position(|e| e.id() == entry.id())?;
            let mut next = current.to_vec();
            next[index] = entry.clone();
            Some(next)
        });
        if changed {
            trace!(table = %self.table, id = %id, "Applied update");
        } else {
            self.warn_unknown(TargetedOp::Update, id);
        }
        changed
    }

    /// Overwrite the fields in `patch` on the entry with identifier `id`.
    ///
    /// Unknown identifiers are a no-op plus one integrity warning.
    pub fn apply_merge(&self, id: &EntryId, patch: &Row) -> bool {
        let changed = self.publish(|current| {
            let index = current.iter().position(|e| e.id() == id)?;
            let mut next = current.to_vec();
            next[index].merge(patch);
            Some(next)
        });
        if changed {
            trace!(table = %self.table, id = %id, fields = patch.len(), "Applied merge");
        } else {
            self.warn_unknown(TargetedOp::Merge, id.clone());
        }
        changed
    }

    /// Remove the entry with identifier `id`, if any.
    pub fn apply_delete(&self, id: &EntryId) -> bool {
        let changed = self.publish(|current| {
            if !current.iter().any(|e| e.id() == id) {
                return None;
            }
            Some(current.iter().filter(|e| e.id() != id).cloned().collect())
        });
        trace!(table = %self.table, id = %id, changed, "Applied delete");
        changed
    }

    /// Swap in the snapshot computed by `f`, if it returns one.
    ///
    /// `f` runs under the channel's write lock; it must not touch the replica.
    fn publish<F>(&self, f: F) -> bool
    where
        F: FnOnce(&[Entry]) -> Option<Vec<Entry>>,
    {
        self.tx.send_if_modified(|snapshot| match f(snapshot.as_slice()) {
            Some(next) => {
                *snapshot = Arc::new(next);
                true
            }
            None => false,
        })
    }

    fn warn_unknown(&self, op: TargetedOp, id: EntryId) {
        let warning = IntegrityWarning::UnknownIdentifier { op, id };
        warn!(table = %self.table, warning = %warning, "Replica integrity warning");
        self.observer.integrity_warning(&self.table, &warning);
    }
}
