// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Channel lifecycle: idempotent join/leave for one realtime channel.
//!
//! # State Machine
//!
//! ```text
//!              ensure_joined()              handshake ok
//!   ┌────────┐ ─────────────▶ ┌─────────┐ ──────────────▶ ┌────────┐
//!   │ Closed │                │ Joining │                 │ Joined │
//!   └────────┘ ◀───────────── └─────────┘                 └────────┘
//!       ▲        handshake failed   ▲                        │    ▲
//!       │                           │ ensure_joined()        │    │ leave failed
//!       │      leave ok        ┌─────────┐  ensure_left()    │    │
//!       └───────────────────── │ Leaving │ ◀─────────────────┘    │
//!                              └─────────┘ ───────────────────────┘
//! ```
//!
//! A leave in progress publishes a single-slot completion signal. A join
//! requested meanwhile claims the `Joining` state at once (so concurrent
//! callers no-op) and waits for that signal before its own handshake, so
//! the transport never sees a join and a leave overlap on one channel.

use crate::backend::{ChannelState, RealtimeChannel};
use crate::error::{ReplicaError, Result};
use crate::observer::SyncObserver;
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

/// Callback fired after each confirmed join.
pub type ReadyCallback = Arc<dyn Fn() + Send + Sync>;

/// Engine-side state of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    Closed,
    Joining,
    Joined,
    Leaving,
}

impl fmt::Display for GateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GateState::Closed => write!(f, "closed"),
            GateState::Joining => write!(f, "joining"),
            GateState::Joined => write!(f, "joined"),
            GateState::Leaving => write!(f, "leaving"),
        }
    }
}

struct GateInner {
    state: GateState,
    /// Completion signal of the leave in progress, if any.
    leave_done: Option<watch::Receiver<bool>>,
}

/// Serializes join and leave handshakes of one channel.
pub struct ChannelGate {
    channel: Arc<dyn RealtimeChannel>,
    inner: Mutex<GateInner>,
    observer: Arc<dyn SyncObserver>,
    on_ready: Option<ReadyCallback>,
}

impl ChannelGate {
    pub fn new(channel: Arc<dyn RealtimeChannel>, observer: Arc<dyn SyncObserver>) -> Self {
        Self {
            channel,
            inner: Mutex::new(GateInner {
                state: GateState::Closed,
                leave_done: None,
            }),
            observer,
            on_ready: None,
        }
    }

    /// Fire `callback` after every successful join handshake.
    pub fn with_ready_callback(mut self, callback: Option<ReadyCallback>) -> Self {
        self.on_ready = callback;
        self
    }

    pub fn name(&self) -> &str {
        self.channel.name()
    }

    pub fn state(&self) -> GateState {
        self.inner.lock().state
    }

    pub fn is_joined(&self) -> bool {
        self.state() == GateState::Joined
    }

    /// The underlying channel handle.
    pub fn channel(&self) -> &Arc<dyn RealtimeChannel> {
        &self.channel
    }

    /// Join unless already joined or joining.
    ///
    /// Waits for a leave in progress before issuing the handshake. A failed
    /// handshake returns the gate to `Closed`, and so does dropping this
    /// future before the handshake completes.
    pub async fn ensure_joined(&self) -> Result<()> {
        let pending_leave = {
            let mut inner = self.inner.lock();
            match inner.state {
                GateState::Joined | GateState::Joining => {
                    trace!(channel = %self.name(), state = %inner.state, "Join already done or in flight");
                    return Ok(());
                }
                GateState::Closed | GateState::Leaving => {}
            }
            inner.state = GateState::Joining;
            inner.leave_done.clone()
        };
        let settle = Settle::new(self, GateState::Joining);
        self.transition(GateState::Joining);

        if let Some(mut done) = pending_leave {
            debug!(channel = %self.name(), "Waiting for leave in progress before joining");
            // A dropped sender also means the leave is over.
            let _ = done.wait_for(|finished| *finished).await;

            // The leave failed and the transport kept the channel.
            if self.channel.state() == ChannelState::Joined {
                debug!(channel = %self.name(), "Channel still joined after leave, skipping handshake");
                settle.disarm();
                self.set_state(GateState::Joined);
                return Ok(());
            }
        }

        let status = self.channel.join().await;
        settle.disarm();
        if status.is_ok() {
            self.set_state(GateState::Joined);
            info!(channel = %self.name(), "Channel joined");
            if let Some(callback) = &self.on_ready {
                callback();
            }
            Ok(())
        } else {
            self.set_state(GateState::Closed);
            warn!(channel = %self.name(), status = %status, "Channel join failed");
            Err(ReplicaError::Handshake {
                channel: self.name().to_string(),
                operation: "join",
                status,
            })
        }
    }

    /// Leave if joined, with no pre-leave work.
    pub async fn ensure_left(&self) -> Result<()> {
        self.ensure_left_with(|| async { Ok(()) }).await
    }

    /// Leave if joined, running `pre_leave` to completion before the handshake.
    ///
    /// If `pre_leave` fails, no handshake is issued, the gate returns to
    /// `Joined` and its error is returned. A failed leave also returns the
    /// gate to `Joined`. Either way the completion signal fires, releasing
    /// any join that waited on it.
    pub async fn ensure_left_with<F, Fut>(&self, pre_leave: F) -> Result<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let done = {
            let mut inner = self.inner.lock();
            if inner.state != GateState::Joined {
                trace!(channel = %self.name(), state = %inner.state, "Leave skipped, channel not joined");
                return Ok(());
            }
            inner.state = GateState::Leaving;
            let (tx, rx) = watch::channel(false);
            inner.leave_done = Some(rx);
            tx
        };
        let settle = Settle::new(self, GateState::Leaving);
        self.transition(GateState::Leaving);

        if let Err(e) = pre_leave().await {
            settle.disarm();
            self.finish_leave(GateState::Joined);
            done.send_replace(true);
            warn!(channel = %self.name(), error = %e, "Pre-leave work failed, staying joined");
            return Err(e);
        }
        let status = self.channel.leave().await;
        settle.disarm();

        self.finish_leave(if status.is_ok() {
            GateState::Closed
        } else {
            GateState::Joined
        });
        done.send_replace(true);

        if status.is_ok() {
            info!(channel = %self.name(), "Channel left");
            Ok(())
        } else {
            warn!(channel = %self.name(), status = %status, "Channel leave failed");
            Err(ReplicaError::Handshake {
                channel: self.name().to_string(),
                operation: "leave",
                status,
            })
        }
    }

    /// Settle a leave on `target`, unless a join claimed the gate meanwhile.
    fn finish_leave(&self, target: GateState) {
        let settled = {
            let mut inner = self.inner.lock();
            inner.leave_done = None;
            if inner.state == GateState::Leaving {
                inner.state = target;
                true
            } else {
                false
            }
        };
        if settled {
            self.transition(target);
        }
    }

    fn set_state(&self, state: GateState) {
        self.inner.lock().state = state;
        self.transition(state);
    }

    fn transition(&self, state: GateState) {
        debug!(channel = %self.name(), state = %state, "Channel state transition");
        self.observer.channel_transition(self.name(), state);
    }
}

/// Resets a gate whose join or leave future was dropped mid-handshake.
///
/// The gate settles on whatever the transport reports: `Joined` if the
/// channel is joined, `Closed` otherwise.
struct Settle<'a> {
    gate: &'a ChannelGate,
    from: GateState,
    armed: bool,
}

impl<'a> Settle<'a> {
    fn new(gate: &'a ChannelGate, from: GateState) -> Self {
        Self {
            gate,
            from,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for Settle<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let target = if self.gate.channel.state() == ChannelState::Joined {
            GateState::Joined
        } else {
            GateState::Closed
        };
        let settled = {
            let mut inner = self.gate.inner.lock();
            if inner.state != self.from {
                false
            } else {
                if self.from == GateState::Leaving {
                    inner.leave_done = None;
                }
                inner.state = target;
                true
            }
        };
        if settled {
            warn!(
                channel = %self.gate.name(),
                interrupted = %self.from,
                state = %target,
                "Handshake interrupted, gate reset"
            );
            self.gate.transition(target);
        }
    }
}
