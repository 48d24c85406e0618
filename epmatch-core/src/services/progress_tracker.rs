//! Progress tracking for batch runs
//!
//! All workers report through one [`ProgressTracker`]; its lock is held only
//! for the counter update. Listeners always get a clone of the aggregate,
//! never a reference to the live value.

use crate::models::{BatchResult, BulkProgress, BulkWorkItem, ItemOutcome, WorkItemState};
use chrono::Utc;
use epmatch_common::events::{EpmatchEvent, EventBus};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Receiver of batch progress
///
/// Only `on_progress` is required; the other hooks default to no-ops.
pub trait ProgressSink: Send + Sync {
    fn on_progress(&self, progress: BulkProgress);

    fn on_batch_started(
        &self,
        _batch_id: Uuid,
        _operation: &str,
        _total_items: usize,
        _max_concurrency: usize,
    ) {
    }

    fn on_item_completed(&self, _batch_id: Uuid, _item: &BulkWorkItem) {}

    fn on_batch_completed(&self, _result: &BatchResult) {}
}

impl<F> ProgressSink for F
where
    F: Fn(BulkProgress) + Send + Sync,
{
    fn on_progress(&self, progress: BulkProgress) {
        (self)(progress)
    }
}

/// Publishes batch events on the bus
impl ProgressSink for EventBus {
    fn on_progress(&self, progress: BulkProgress) {
        self.emit_lossy(EpmatchEvent::BatchProgressUpdate {
            batch_id: progress.batch_id,
            total: progress.total,
            completed: progress.completed(),
            succeeded: progress.succeeded,
            failed: progress.failed,
            skipped: progress.skipped,
            cancelled: progress.cancelled,
            percentage: progress.percentage(),
            current_file: progress.current_file.clone(),
            elapsed_seconds: progress.elapsed.as_secs(),
            estimated_remaining_seconds: progress.estimated_remaining.map(|d| d.as_secs()),
            timestamp: Utc::now(),
        });
    }

    fn on_batch_started(
        &self,
        batch_id: Uuid,
        operation: &str,
        total_items: usize,
        max_concurrency: usize,
    ) {
        self.emit_lossy(EpmatchEvent::BatchStarted {
            batch_id,
            operation: operation.to_string(),
            total_items,
            max_concurrency,
            timestamp: Utc::now(),
        });
    }

    fn on_item_completed(&self, batch_id: Uuid, item: &BulkWorkItem) {
        self.emit_lossy(EpmatchEvent::BatchItemCompleted {
            batch_id,
            path: item.display_path(),
            state: item.state.as_str().to_string(),
            attempts: item.attempt,
            error: item.last_error.clone(),
            timestamp: Utc::now(),
        });
    }

    fn on_batch_completed(&self, result: &BatchResult) {
        self.emit_lossy(EpmatchEvent::BatchCompleted {
            batch_id: result.batch_id,
            succeeded: result.counts.succeeded,
            failed: result.counts.failed,
            skipped: result.counts.skipped,
            cancelled: result.counts.cancelled,
            aborted: result.aborted,
            duration_ms: result.duration.as_millis() as u64,
            timestamp: Utc::now(),
        });
    }
}

/// Synchronized accumulator for one batch
pub struct ProgressTracker {
    progress: Mutex<BulkProgress>,
    started: Instant,
}

impl ProgressTracker {
    pub fn new(batch_id: Uuid, total: usize) -> Self {
        Self {
            progress: Mutex::new(BulkProgress::new(batch_id, total)),
            started: Instant::now(),
        }
    }

    fn update<R>(&self, f: impl FnOnce(&mut BulkProgress) -> R) -> R {
        let mut progress = self.progress.lock().unwrap_or_else(|e| e.into_inner());
        let result = f(&mut progress);
        refresh_timing(&mut progress, self.started.elapsed());
        result
    }

    /// A worker picked up an item
    pub fn item_started(&self, path: &str) -> BulkProgress {
        self.update(|p| {
            p.processing += 1;
            p.current_file = Some(path.to_string());
            p.clone()
        })
    }

    /// An item reached its terminal state
    pub fn item_finished(&self, item: &BulkWorkItem, outcome: Option<&ItemOutcome>) -> BulkProgress {
        self.update(|p| {
            if item.attempt > 0 {
                p.processing = p.processing.saturating_sub(1);
            }
            match item.state {
                WorkItemState::Succeeded => p.succeeded += 1,
                WorkItemState::Failed => p.failed += 1,
                WorkItemState::Skipped => p.skipped += 1,
                WorkItemState::Cancelled => p.cancelled += 1,
                WorkItemState::Pending | WorkItemState::Processing => {}
            }
            if let Some(outcome) = outcome {
                p.statistics.record_outcome(outcome);
            }
            p.clone()
        })
    }

    pub fn record_retry(&self) {
        self.update(|p| p.statistics.retries += 1);
    }

    pub fn record_timeout(&self) {
        self.update(|p| p.statistics.timeouts += 1);
    }

    /// Current aggregate (a clone)
    pub fn snapshot(&self) -> BulkProgress {
        self.update(|p| p.clone())
    }
}

fn refresh_timing(progress: &mut BulkProgress, elapsed: Duration) {
    progress.elapsed = elapsed;

    let completed = progress.completed();
    progress.estimated_remaining = if completed > 0 && progress.total > completed {
        let per_item = elapsed.as_secs_f64() / completed as f64;
        Some(Duration::from_secs_f64(
            per_item * (progress.total - completed) as f64,
        ))
    } else {
        None
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::StoreOutcome;
    use std::sync::Arc;

    #[test]
    fn test_counts_follow_items() {
        let tracker = ProgressTracker::new(Uuid::new_v4(), 3);

        let mut item = BulkWorkItem::new(0, "a.srt");
        item.begin_attempt();
        let progress = tracker.item_started("a.srt");
        assert_eq!(progress.processing, 1);
        assert_eq!(progress.current_file.as_deref(), Some("a.srt"));

        item.finish(WorkItemState::Skipped, None);
        let outcome = ItemOutcome::Stored {
            outcome: StoreOutcome::RejectedDuplicate {
                existing_entry_id: Uuid::nil(),
            },
        };
        let progress = tracker.item_finished(&item, Some(&outcome));
        assert_eq!(progress.processing, 0);
        assert_eq!(progress.skipped, 1);
        assert_eq!(progress.statistics.duplicates_rejected, 1);
        assert!(progress.estimated_remaining.is_some());
    }

    #[test]
    fn test_unstarted_cancel_does_not_touch_processing() {
        let tracker = ProgressTracker::new(Uuid::new_v4(), 2);
        let mut item = BulkWorkItem::new(1, "b.srt");
        item.finish(WorkItemState::Cancelled, None);
        let progress = tracker.item_finished(&item, None);
        assert_eq!(progress.processing, 0);
        assert_eq!(progress.cancelled, 1);
    }

    #[test]
    fn test_snapshot_is_a_copy() {
        let tracker = ProgressTracker::new(Uuid::new_v4(), 1);
        let before = tracker.snapshot();
        tracker.record_retry();
        assert_eq!(before.statistics.retries, 0);
        assert_eq!(tracker.snapshot().statistics.retries, 1);
    }

    #[test]
    fn test_closure_sink_receives_clone() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_by_sink = Arc::clone(&seen);
        let sink = move |p: BulkProgress| seen_by_sink.lock().unwrap().push(p.completed());

        let tracker = ProgressTracker::new(Uuid::new_v4(), 1);
        let mut item = BulkWorkItem::new(0, "c.srt");
        item.begin_attempt();
        tracker.item_started("c.srt");
        item.finish(WorkItemState::Succeeded, None);
        sink.on_progress(tracker.item_finished(&item, None));

        assert_eq!(*seen.lock().unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn test_event_bus_sink() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        let tracker = ProgressTracker::new(Uuid::new_v4(), 4);

        bus.on_progress(tracker.snapshot());
        match rx.recv().await.unwrap() {
            EpmatchEvent::BatchProgressUpdate { total, completed, .. } => {
                assert_eq!(total, 4);
                assert_eq!(completed, 0);
            }
            other => panic!("Unexpected event: {:?}", other),
        }
    }
}
