//! # Replication Hook
//!
//! The object store does not replicate anything itself. After every command
//! whose events were persisted and applied it calls
//! [`ReplicationTrigger::trigger`] with those events, fire-and-forget. The
//! trigger must not block and cannot fail the command.
//!
//! [`BroadcastTrigger`] fans batches out on a `tokio::sync::broadcast`
//! channel. An external replicator subscribes and ships them to peers using
//! the [`transport`](crate::transport) envelope.
//!
//! ## Backpressure
//!
//! The channel is bounded. A subscriber that falls more than `capacity`
//! batches behind gets [`Error::Lagged`] once and then continues with the
//! oldest batch still buffered; the missed range has to be re-read from
//! storage.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::types::Event;

/// Default number of batches buffered per subscriber.
pub const DEFAULT_BROADCAST_CAPACITY: usize = 1024;

/// Events of one acknowledged command.
pub type EventBatch = Arc<[Event]>;

/// Notification hook called after each acknowledged command.
pub trait ReplicationTrigger: Send + Sync {
    /// Receives the events of one command, in stored order.
    fn trigger(&self, events: &[Event]);
}

// =============================================================================
// Broadcast Trigger
// =============================================================================

/// A [`ReplicationTrigger`] publishing every batch to broadcast subscribers.
pub struct BroadcastTrigger {
    sender: broadcast::Sender<EventBatch>,
}

impl BroadcastTrigger {
    /// Creates a trigger buffering up to `capacity` batches per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribes to batches triggered from now on.
    pub fn subscribe(&self) -> ReplicationFeed {
        ReplicationFeed {
            receiver: self.sender.subscribe(),
        }
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for BroadcastTrigger {
    fn default() -> Self {
        Self::new(DEFAULT_BROADCAST_CAPACITY)
    }
}

impl ReplicationTrigger for BroadcastTrigger {
    fn trigger(&self, events: &[Event]) {
        if events.is_empty() {
            return;
        }
        // No subscribers is not an error; the batch is simply not replicated.
        match self.sender.send(Arc::from(events)) {
            Ok(receivers) => debug!(events = events.len(), receivers, "triggered replication"),
            Err(_) => debug!(events = events.len(), "no replication subscribers"),
        }
    }
}

// =============================================================================
// Feed
// =============================================================================

/// Receiving side of a [`BroadcastTrigger`].
pub struct ReplicationFeed {
    receiver: broadcast::Receiver<EventBatch>,
}

impl ReplicationFeed {
    /// Waits for the next batch. `None` once the trigger is dropped.
    ///
    /// # Errors
    ///
    /// [`Error::Lagged`] if batches were dropped since the last call. The
    /// next call resumes with the oldest batch still buffered.
    pub async fn next(&mut self) -> Result<Option<EventBatch>> {
        match self.receiver.recv().await {
            Ok(batch) => Ok(Some(batch)),
            Err(broadcast::error::RecvError::Closed) => Ok(None),
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(missed, "replication subscriber lagged");
                Err(Error::Lagged { missed })
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
