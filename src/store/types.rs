//! Engine surface types.

use crate::lifecycle::{GateState, ReadyCallback};
use crate::observer::{MetricsObserver, SyncObserver};
use std::sync::Arc;

/// What happened to a `mutate()` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutateOutcome {
    /// Written to the durable store.
    Persisted,

    /// Applied locally and broadcast; persisted by a later flush.
    ///
    /// `delivered` is `false` if the broadcast was not acknowledged within
    /// the retry budget: peers may not have it yet, the durable write will
    /// still happen on flush.
    Buffered { delivered: bool },
}

impl MutateOutcome {
    pub fn is_buffered(&self) -> bool {
        matches!(self, MutateOutcome::Buffered { .. })
    }
}

/// Engine-side state of both channels of a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelStates {
    pub changes: GateState,
    pub broadcast: GateState,
}

impl ChannelStates {
    pub fn all_closed(&self) -> bool {
        self.changes == GateState::Closed && self.broadcast == GateState::Closed
    }

    pub fn all_joined(&self) -> bool {
        self.changes == GateState::Joined && self.broadcast == GateState::Joined
    }
}

/// Injected callbacks.
#[derive(Clone)]
pub struct ReplicaHooks {
    /// Receives integrity warnings, transitions, deliveries and flushes.
    pub observer: Arc<dyn SyncObserver>,
    /// Fired after each confirmed join of the broadcast channel.
    pub on_ready: Option<ReadyCallback>,
}

impl Default for ReplicaHooks {
    fn default() -> Self {
        Self {
            observer: Arc::new(MetricsObserver),
            on_ready: None,
        }
    }
}

impl ReplicaHooks {
    pub fn with_observer(mut self, observer: Arc<dyn SyncObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn on_ready<F>(mut self, callback: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_ready = Some(Arc::new(callback));
        self
    }
}

impl std::fmt::Debug for ReplicaHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicaHooks")
            .field("on_ready", &self.on_ready.is_some())
            .finish_non_exhaustive()
    }
}
