//! Resilience utilities: bounded retry for broadcast sends.
//!
//! Broadcast channels give no delivery guarantee; a send can time out or be
//! rejected while the socket reconnects. [`send_with_retry`] resends the same
//! message with a fixed pause between failures, up to
//! [`SendRetryConfig::max_attempts`] attempts.
//!
//! # Schedule (defaults)
//!
//! ```text
//! Attempt  Status     Pause after
//! -------  ------     -----------
//! 1        timed out  100ms
//! 2        timed out  100ms
//! ...
//! 10       timed out  (none, give up)
//! ```
//!
//! The first attempt is never delayed, and nothing sleeps after a success.
//! Exhaustion is not an error here: the caller gets the last status back in
//! the [`Delivery`] and decides what to do with it.
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example(channel: &dyn realtime_replica::backend::RealtimeChannel,
//! #                  message: realtime_replica::backend::BroadcastMessage) {
//! use realtime_replica::config::SendRetryConfig;
//! use realtime_replica::resilience::send_with_retry;
//!
//! let delivery = send_with_retry(channel, message, &SendRetryConfig::default()).await;
//! if !delivery.is_delivered() {
//!     eprintln!("peers did not get it after {} attempts", delivery.attempts);
//! }
//! # }
//! ```

use crate::backend::{BroadcastMessage, ChannelStatus, RealtimeChannel};
use crate::config::SendRetryConfig;
use crate::error::ReplicaError;
use tracing::{debug, warn};

/// Outcome of a send with retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Status of the final attempt.
    pub status: ChannelStatus,
    /// Attempts made, including the first.
    pub attempts: u32,
}

impl Delivery {
    /// Whether the transport acknowledged the message.
    pub fn is_delivered(&self) -> bool {
        self.status.is_ok()
    }

    /// Convert to a `Result`, mapping exhaustion to [`ReplicaError::Delivery`].
    pub fn into_result(self, channel: &str) -> crate::error::Result<u32> {
        if self.is_delivered() {
            Ok(self.attempts)
        } else {
            Err(ReplicaError::Delivery {
                channel: channel.to_string(),
                attempts: self.attempts,
                status: self.status,
            })
        }
    }
}

/// Send `message` on `channel`, retrying failures with a fixed backoff.
///
/// Stops at the first `Ok` or after `config.max_attempts` attempts. A
/// `max_attempts` of zero still makes one attempt.
pub async fn send_with_retry(
    channel: &dyn RealtimeChannel,
    message: BroadcastMessage,
    config: &SendRetryConfig,
) -> Delivery {
    let max_attempts = config.max_attempts.max(1);
    let mut attempts = 0;

    loop {
        attempts += 1;
        let status = channel.send(message.clone()).await;

        if status.is_ok() {
            if attempts > 1 {
                debug!(
                    channel = %channel.name(),
                    id = %message.id,
                    attempts,
                    "Broadcast delivered after retry"
                );
            }
            return Delivery { status, attempts };
        }

        if attempts >= max_attempts {
            warn!(
                channel = %channel.name(),
                id = %message.id,
                attempts,
                status = %status,
                "Broadcast not acknowledged, giving up"
            );
            return Delivery { status, attempts };
        }

        debug!(
            channel = %channel.name(),
            attempt = attempts,
            status = %status,
            backoff_ms = config.backoff_ms,
            "Broadcast send failed, retrying"
        );
        tokio::time::sleep(config.backoff()).await;
    }
}
