// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Ephemeral shared set: a broadcast-only replicated collection.
//!
//! No durable store is involved. Entries live only in the replicas of the
//! clients joined to the set's channel, identified by UUID v4 strings
//! generated at `add()`. Every write is a broadcast; the self-echo applies it
//! locally, so an undelivered write is not visible anywhere.
//!
//! Useful for presence, cursors and other state that should disappear with
//! its clients.

use crate::backend::RealtimeTransport;
use crate::broadcast::BroadcastAdapter;
use crate::config::SharedSetConfig;
use crate::entry::{row_id, strip_id, Entry, EntryId, Row};
use crate::error::{ReplicaError, Result};
use crate::lifecycle::GateState;
use crate::metrics;
use crate::replica::{Replica, Snapshot};
use crate::store::ReplicaHooks;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// A set of entries shared over one broadcast channel.
pub struct SharedSet<T: RealtimeTransport> {
    config: SharedSetConfig,
    transport: Arc<T>,
    replica: Arc<Replica>,
    broadcast: BroadcastAdapter,
    subscribers: Mutex<usize>,
}

impl<T: RealtimeTransport> SharedSet<T> {
    /// Create a set seeded with `initial` rows.
    ///
    /// Rows without an identifier under `config.index_name` get a fresh one.
    pub fn new(transport: Arc<T>, config: SharedSetConfig, initial: Vec<Row>) -> Result<Self> {
        Self::with_hooks(transport, config, initial, ReplicaHooks::default())
    }

    pub fn with_hooks(
        transport: Arc<T>,
        config: SharedSetConfig,
        initial: Vec<Row>,
        hooks: ReplicaHooks,
    ) -> Result<Self> {
        config.validate()?;

        let entries = initial
            .into_iter()
            .map(|mut row| {
                let id = row_id(&row, &config.index_name).unwrap_or_else(EntryId::random);
                strip_id(&mut row, &config.index_name);
                Entry::new(id, row)
            })
            .collect();
        let replica = Arc::new(Replica::with_entries(
            config.name.clone(),
            hooks.observer.clone(),
            entries,
        ));

        let broadcast = BroadcastAdapter::new(
            transport.as_ref(),
            &config.channel_name(),
            &config.event(),
            &config.index_name,
            config.send_retry.clone(),
            replica.clone(),
            hooks.observer,
            hooks.on_ready,
        );

        debug!(set = %config.name, entries = replica.len(), "Created shared set");
        Ok(Self {
            config,
            transport,
            replica,
            broadcast,
            subscribers: Mutex::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &SharedSetConfig {
        &self.config
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    pub fn snapshot(&self) -> Snapshot {
        self.replica.read()
    }

    pub fn get(&self, id: &EntryId) -> Option<Entry> {
        self.replica.get(id)
    }

    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.replica.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        *self.subscribers.lock()
    }

    pub fn channel_state(&self) -> GateState {
        self.broadcast.gate().state()
    }

    /// Register a subscriber, joining the channel if needed.
    pub async fn acquire(&self) -> Result<watch::Receiver<Snapshot>> {
        let count = {
            let mut subscribers = self.subscribers.lock();
            *subscribers += 1;
            *subscribers
        };
        metrics::set_subscribers(self.name(), count);

        if let Err(e) = self.broadcast.gate().ensure_joined().await {
            if let Err(release_err) = self.release().await {
                warn!(set = %self.name(), error = %release_err, "Release after failed acquire also failed");
            }
            return Err(e);
        }
        Ok(self.replica.subscribe())
    }

    /// Drop a subscriber; the last one leaves the channel.
    pub async fn release(&self) -> Result<()> {
        let remaining = {
            let mut subscribers = self.subscribers.lock();
            if *subscribers == 0 {
                return Ok(());
            }
            *subscribers -= 1;
            *subscribers
        };
        metrics::set_subscribers(self.name(), remaining);

        if remaining == 0 {
            info!(set = %self.name(), "Last subscriber released, leaving channel");
            self.broadcast.gate().ensure_left().await?;
        }
        Ok(())
    }

    /// Broadcast a new entry and return its generated identifier.
    pub async fn add(&self, mut row: Row) -> Result<EntryId> {
        self.require_joined()?;
        strip_id(&mut row, &self.config.index_name);

        let entry = Entry::new(EntryId::random(), row);
        self.broadcast
            .send_add(&entry)
            .await
            .into_result(self.broadcast.gate().name())?;
        Ok(entry.id().clone())
    }

    pub async fn remove(&self, id: impl Into<EntryId>) -> Result<()> {
        self.require_joined()?;
        self.broadcast
            .send_remove(id.into())
            .await
            .into_result(self.broadcast.gate().name())?;
        Ok(())
    }

    /// Broadcast a field-level overwrite of one entry.
    pub async fn mutate(&self, id: impl Into<EntryId>, mut patch: Row) -> Result<()> {
        self.require_joined()?;
        strip_id(&mut patch, &self.config.index_name);
        self.broadcast
            .send_mutate(id.into(), patch)
            .await
            .into_result(self.broadcast.gate().name())?;
        Ok(())
    }

    fn require_joined(&self) -> Result<()> {
        if self.broadcast.is_joined() {
            Ok(())
        } else {
            Err(ReplicaError::NotJoined {
                channel: self.broadcast.gate().name().to_string(),
            })
        }
    }
}
