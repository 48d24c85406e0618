//! Concurrent batch processor
//!
//! Drives a [`WorkHandler`] over a list of files with bounded concurrency.
//! Each item is independent: its failure is isolated unless the abort policy
//! (`continue_on_error = false`, or more than `max_errors_before_abort`
//! failures) trips, in which case outstanding work is cancelled and the
//! partial result is returned.
//!
//! Only retryable errors (timeouts, transient I/O, database locks) consume
//! retry attempts; the delay doubles from `retry_base_delay` between attempts.
//! Results are reported in submission order regardless of completion order.
//!
//! Handlers with order-sensitive side effects (the store) return an
//! [`ItemStep::Commit`]: reading and hashing run in parallel, but the commit
//! only starts once every lower-indexed item is terminal, so in-batch
//! duplicates resolve the same way at any concurrency.

use crate::error::ItemError;
use crate::models::{
    BatchCounts, BatchOptions, BatchResult, BatchStatistics, BulkWorkItem, ItemOutcome,
    ItemReport, WorkItemState,
};
use crate::services::progress_tracker::{ProgressSink, ProgressTracker};
use futures::future::BoxFuture;
use futures::stream::{self, StreamExt};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Staged write, run once the item's turn comes up
pub type OrderedCommit = BoxFuture<'static, Result<ItemOutcome, ItemError>>;

/// Result of one handler attempt
pub enum ItemStep {
    /// Finished, nothing left to order
    Done(ItemOutcome),
    /// Work staged; the processor awaits the commit in submission order
    Commit(OrderedCommit),
}

impl From<ItemOutcome> for ItemStep {
    fn from(outcome: ItemOutcome) -> Self {
        ItemStep::Done(outcome)
    }
}

/// Per-item work performed by the batch processor
#[async_trait::async_trait]
pub trait WorkHandler: Send + Sync {
    /// Operation name for events and logs ("identify", "store")
    fn operation(&self) -> &'static str;

    /// Process one item (one attempt)
    ///
    /// `cancel` fires when the batch is aborted or cancelled; long-running
    /// handlers should check it between steps.
    async fn handle(
        &self,
        item: &BulkWorkItem,
        cancel: &CancellationToken,
    ) -> Result<ItemStep, ItemError>;
}

/// Releases ordered commits by item index
///
/// The frontier is the lowest index that has not reached a terminal state.
/// `buffer_unordered` starts items in index order, so the frontier item is
/// always in flight and waiting on it cannot deadlock.
struct CommitSequencer {
    finished: Mutex<BTreeSet<usize>>,
    frontier: watch::Sender<usize>,
}

impl CommitSequencer {
    fn new() -> Self {
        let (frontier, _) = watch::channel(0);
        Self {
            finished: Mutex::new(BTreeSet::new()),
            frontier,
        }
    }

    async fn wait_turn(&self, index: usize) {
        let mut rx = self.frontier.subscribe();
        // The sender lives as long as the run; an error cannot happen here
        let _ = rx.wait_for(|frontier| *frontier >= index).await;
    }

    fn item_finished(&self, index: usize) {
        let mut finished = self.finished.lock().unwrap_or_else(|e| e.into_inner());
        finished.insert(index);
        self.frontier.send_modify(|frontier| {
            while finished.remove(frontier) {
                *frontier += 1;
            }
        });
    }
}

/// Shared state of one run
struct RunContext {
    batch_id: Uuid,
    handler: Arc<dyn WorkHandler>,
    options: BatchOptions,
    tracker: ProgressTracker,
    sink: Option<Arc<dyn ProgressSink>>,
    /// Child of the caller's token; also fired by the abort policy
    abort: CancellationToken,
    failures: AtomicUsize,
    abort_reason: Mutex<Option<String>>,
    sequencer: CommitSequencer,
}

impl RunContext {
    fn trip_abort(&self, reason: String) {
        let mut slot = self.abort_reason.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_none() {
            warn!(batch_id = %self.batch_id, reason = %reason, "Aborting batch");
            *slot = Some(reason);
        }
        self.abort.cancel();
    }
}

/// Bounded-concurrency batch driver
#[derive(Debug, Clone, Default)]
pub struct BatchProcessor {
    options: BatchOptions,
}

impl BatchProcessor {
    pub fn new(options: BatchOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &BatchOptions {
        &self.options
    }

    /// Process every path and return the aggregate result
    pub async fn process(
        &self,
        handler: Arc<dyn WorkHandler>,
        paths: Vec<PathBuf>,
        sink: Option<Arc<dyn ProgressSink>>,
        cancel: CancellationToken,
    ) -> BatchResult {
        let batch_id = Uuid::new_v4();
        let started = Instant::now();
        let concurrency = self.options.effective_concurrency();
        let total = paths.len();
        let operation = handler.operation();

        info!(
            batch_id = %batch_id,
            operation,
            total,
            concurrency,
            "Batch started"
        );
        if let Some(sink) = &sink {
            sink.on_batch_started(batch_id, operation, total, concurrency);
        }

        let ctx = Arc::new(RunContext {
            batch_id,
            handler,
            options: self.options.clone(),
            tracker: ProgressTracker::new(batch_id, total),
            sink,
            abort: cancel.child_token(),
            failures: AtomicUsize::new(0),
            abort_reason: Mutex::new(None),
            sequencer: CommitSequencer::new(),
        });

        let items: Vec<BulkWorkItem> = paths
            .into_iter()
            .enumerate()
            .map(|(index, path)| BulkWorkItem::new(index, path))
            .collect();

        let mut reports: Vec<ItemReport> = stream::iter(items)
            .map(|item| {
                let ctx = Arc::clone(&ctx);
                async move { run_item(&ctx, item).await }
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;

        reports.sort_by_key(|r| r.item.index);

        let counts = BatchCounts::from_items(reports.iter().map(|r| &r.item));
        let mut statistics = BatchStatistics::default();
        for outcome in reports.iter().filter_map(|r| r.outcome.as_ref()) {
            statistics.record_outcome(outcome);
        }
        let live = ctx.tracker.snapshot();
        statistics.retries = live.statistics.retries;
        statistics.timeouts = live.statistics.timeouts;

        let mut abort_reason = ctx
            .abort_reason
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if abort_reason.is_none() && cancel.is_cancelled() {
            abort_reason = Some("cancelled by caller".to_string());
        }

        let result = BatchResult {
            batch_id,
            items: reports,
            counts,
            aborted: abort_reason.is_some(),
            abort_reason,
            duration: started.elapsed(),
            statistics,
        };

        info!(
            batch_id = %batch_id,
            succeeded = result.counts.succeeded,
            failed = result.counts.failed,
            skipped = result.counts.skipped,
            cancelled = result.counts.cancelled,
            aborted = result.aborted,
            duration_ms = result.duration.as_millis(),
            "Batch finished"
        );
        if let Some(sink) = &ctx.sink {
            sink.on_batch_completed(&result);
        }

        result
    }
}

/// Drive one item to a terminal state
async fn run_item(ctx: &RunContext, mut item: BulkWorkItem) -> ItemReport {
    let outcome = if ctx.abort.is_cancelled() {
        item.finish(WorkItemState::Cancelled, Some(&ItemError::Cancelled));
        None
    } else {
        ctx.tracker.item_started(&item.display_path());
        attempt_until_terminal(ctx, &mut item).await
    };
    ctx.sequencer.item_finished(item.index);

    let progress = ctx.tracker.item_finished(&item, outcome.as_ref());
    if let Some(sink) = &ctx.sink {
        sink.on_item_completed(ctx.batch_id, &item);
        sink.on_progress(progress);
    }

    ItemReport { item, outcome }
}

async fn attempt_until_terminal(ctx: &RunContext, item: &mut BulkWorkItem) -> Option<ItemOutcome> {
    let options = &ctx.options;
    let mut retries: u32 = 0;

    loop {
        item.begin_attempt();

        let result = tokio::select! {
            biased;
            _ = ctx.abort.cancelled() => Err(ItemError::Cancelled),
            attempt = tokio::time::timeout(options.item_timeout, ctx.handler.handle(item, &ctx.abort)) => {
                attempt.unwrap_or(Err(ItemError::Timeout(options.item_timeout)))
            }
        };

        let result = match result {
            Ok(ItemStep::Done(outcome)) => Ok(outcome),
            Ok(ItemStep::Commit(commit)) => commit_in_turn(ctx, item.index, commit).await,
            Err(err) => Err(err),
        };

        let err = match result {
            Ok(outcome) => {
                item.finish(outcome.terminal_state(), None);
                return Some(outcome);
            }
            Err(err) => err,
        };

        if matches!(err, ItemError::Timeout(_)) {
            ctx.tracker.record_timeout();
        }

        if matches!(err, ItemError::Cancelled) {
            item.finish(WorkItemState::Cancelled, Some(&err));
            return None;
        }

        if err.is_retryable() && retries < options.retry_attempts {
            retries += 1;
            let delay = options.backoff_delay(retries);
            item.record_attempt_error(&err);
            ctx.tracker.record_retry();
            warn!(
                path = %item.path.display(),
                attempt = item.attempt,
                retry = retries,
                delay_ms = delay.as_millis(),
                error = %err,
                "Retryable failure, backing off"
            );

            tokio::select! {
                biased;
                _ = ctx.abort.cancelled() => {
                    item.finish(WorkItemState::Cancelled, Some(&ItemError::Cancelled));
                    return None;
                }
                _ = tokio::time::sleep(delay) => {}
            }
            continue;
        }

        let err = if err.is_retryable() {
            ItemError::RetryExhausted {
                attempts: item.attempt,
                last_error: Box::new(err),
            }
        } else {
            err
        };

        error!(
            path = %item.path.display(),
            attempts = item.attempt,
            kind = ?err.kind(),
            error = %err,
            "Item failed"
        );
        item.finish(WorkItemState::Failed, Some(&err));

        let failures = ctx.failures.fetch_add(1, Ordering::SeqCst) + 1;
        if !options.continue_on_error {
            ctx.trip_abort(format!("{} failed and continue_on_error is off", item.display_path()));
        } else if failures > options.max_errors_before_abort {
            ctx.trip_abort(format!(
                "{} failures exceeded max_errors_before_abort ({})",
                failures, options.max_errors_before_abort
            ));
        }

        return None;
    }
}

/// Wait for every lower-indexed item to finish, then run the commit
///
/// A commit that has started is not raced against the abort token: a
/// write either lands or fails on its own.
async fn commit_in_turn(
    ctx: &RunContext,
    index: usize,
    commit: OrderedCommit,
) -> Result<ItemOutcome, ItemError> {
    tokio::select! {
        biased;
        _ = ctx.abort.cancelled() => return Err(ItemError::Cancelled),
        _ = ctx.sequencer.wait_turn(index) => {}
    }

    let item_timeout = ctx.options.item_timeout;
    tokio::time::timeout(item_timeout, commit)
        .await
        .unwrap_or(Err(ItemError::Timeout(item_timeout)))
}
