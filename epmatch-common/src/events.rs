//! Event types for the epmatch event system
//!
//! Provides the shared event enum and the broadcast EventBus used to publish
//! batch progress to any number of listeners (UI, logs, tests).

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// epmatch event types
///
/// Events are broadcast via EventBus and can be serialized for transmission.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EpmatchEvent {
    /// A batch was enumerated and is about to start
    BatchStarted {
        batch_id: Uuid,
        /// "identify" or "store"
        operation: String,
        total_items: usize,
        max_concurrency: usize,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Aggregate progress of a running batch
    BatchProgressUpdate {
        batch_id: Uuid,
        total: usize,
        completed: usize,
        succeeded: usize,
        failed: usize,
        skipped: usize,
        cancelled: usize,
        percentage: f32,
        current_file: Option<String>,
        elapsed_seconds: u64,
        estimated_remaining_seconds: Option<u64>,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// One work item reached a terminal state
    BatchItemCompleted {
        batch_id: Uuid,
        path: String,
        /// Terminal state name (SUCCEEDED, FAILED, SKIPPED, CANCELLED)
        state: String,
        attempts: u32,
        error: Option<String>,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// The batch finished (fully, partially, or aborted)
    BatchCompleted {
        batch_id: Uuid,
        succeeded: usize,
        failed: usize,
        skipped: usize,
        cancelled: usize,
        aborted: bool,
        duration_ms: u64,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Content identical to an existing entry was not stored
    DuplicateContentRejected {
        existing_entry_id: Uuid,
        series: String,
        season: String,
        episode: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    },
}

/// Broadcast bus for [`EpmatchEvent`]
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EpmatchEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus with specified channel capacity
    ///
    /// Slow subscribers lose the oldest events once `capacity` is exceeded.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<EpmatchEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Returns `Ok(subscriber_count)` if at least one subscriber exists.
    #[allow(clippy::result_large_err)]
    pub fn emit(
        &self,
        event: EpmatchEvent,
    ) -> Result<usize, broadcast::error::SendError<EpmatchEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: EpmatchEvent) {
        let _ = self.tx.send(event);
    }

    /// Current number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Configured channel capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
