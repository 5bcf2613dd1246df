//! Observer that records every engine event.
//!
//! Counts integrity warnings, channel transitions, broadcast deliveries and
//! flushes for assertions.

use parking_lot::Mutex;
use realtime_replica::lifecycle::GateState;
use realtime_replica::observer::{IntegrityWarning, SyncObserver};
use realtime_replica::resilience::Delivery;
use realtime_replica::write_buffer::FlushResult;

/// A recorded channel transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub channel: String,
    pub state: GateState,
}

#[derive(Default)]
pub struct RecordingObserver {
    warnings: Mutex<Vec<IntegrityWarning>>,
    transitions: Mutex<Vec<Transition>>,
    deliveries: Mutex<Vec<Delivery>>,
    flushes: Mutex<Vec<FlushResult>>,
}

impl RecordingObserver {
    pub fn warnings(&self) -> Vec<IntegrityWarning> {
        self.warnings.lock().clone()
    }

    pub fn warning_count(&self) -> usize {
        self.warnings.lock().len()
    }

    /// States a channel went through, in order.
    pub fn states_of(&self, channel: &str) -> Vec<GateState> {
        self.transitions
            .lock()
            .iter()
            .filter(|t| t.channel == channel)
            .map(|t| t.state)
            .collect()
    }

    pub fn deliveries(&self) -> Vec<Delivery> {
        self.deliveries.lock().clone()
    }

    pub fn flushes(&self) -> Vec<FlushResult> {
        self.flushes.lock().clone()
    }
}

impl SyncObserver for RecordingObserver {
    fn integrity_warning(&self, _table: &str, warning: &IntegrityWarning) {
        self.warnings.lock().push(warning.clone());
    }

    fn channel_transition(&self, channel: &str, state: GateState) {
        self.transitions.lock().push(Transition {
            channel: channel.to_string(),
            state,
        });
    }

    fn broadcast_delivery(&self, _channel: &str, delivery: &Delivery) {
        self.deliveries.lock().push(delivery.clone());
    }

    fn flushed(&self, _table: &str, result: &FlushResult) {
        self.flushes.lock().push(result.clone());
    }
}
