//! Bulk processing models
//!
//! A [`BulkWorkItem`] is owned by exactly one worker while it runs. The
//! shared [`BulkProgress`] aggregate lives behind the progress tracker's lock
//! and is only ever handed out as a clone.

use super::entry::StoreOutcome;
use super::match_result::{MatchOutcome, MatchResult, MatchTier};
use crate::error::{ItemError, ItemErrorKind};
use chrono::{DateTime, Utc};
use epmatch_common::config::{BatchConfig, MAX_CONCURRENCY, MIN_CONCURRENCY};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

/// Upper bound for a single backoff delay
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Work item state
///
/// Pending -> Processing -> {Succeeded | Failed | Skipped | Cancelled}.
/// Terminal states are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WorkItemState {
    Pending,
    Processing,
    Succeeded,
    Failed,
    Skipped,
    Cancelled,
}

impl WorkItemState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkItemState::Succeeded
                | WorkItemState::Failed
                | WorkItemState::Skipped
                | WorkItemState::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkItemState::Pending => "PENDING",
            WorkItemState::Processing => "PROCESSING",
            WorkItemState::Succeeded => "SUCCEEDED",
            WorkItemState::Failed => "FAILED",
            WorkItemState::Skipped => "SKIPPED",
            WorkItemState::Cancelled => "CANCELLED",
        }
    }
}

/// One input file of a batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkWorkItem {
    /// Position in the submitted list; results are reported in this order
    pub index: usize,
    pub path: PathBuf,
    pub state: WorkItemState,
    /// Attempts started so far
    pub attempt: u32,
    pub last_error: Option<String>,
    pub error_kind: Option<ItemErrorKind>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl BulkWorkItem {
    pub fn new(index: usize, path: impl Into<PathBuf>) -> Self {
        Self {
            index,
            path: path.into(),
            state: WorkItemState::Pending,
            attempt: 0,
            last_error: None,
            error_kind: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    /// Enter Processing for a new attempt
    pub fn begin_attempt(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        self.state = WorkItemState::Processing;
        self.attempt += 1;
        self.started_at.get_or_insert_with(Utc::now);
    }

    /// Record a failed attempt that will be retried
    pub fn record_attempt_error(&mut self, error: &ItemError) {
        self.last_error = Some(error.to_string());
        self.error_kind = Some(error.kind());
    }

    /// Move to a terminal state
    ///
    /// Returns false (and changes nothing) if the item is already terminal.
    pub fn finish(&mut self, state: WorkItemState, error: Option<&ItemError>) -> bool {
        if self.state.is_terminal() || !state.is_terminal() {
            return false;
        }
        self.state = state;
        if let Some(err) = error {
            self.record_attempt_error(err);
        }
        self.finished_at = Some(Utc::now());
        true
    }

    pub fn display_path(&self) -> String {
        self.path.display().to_string()
    }
}

/// Options for one batch run
#[derive(Debug, Clone, PartialEq)]
pub struct BatchOptions {
    pub max_concurrency: usize,
    pub continue_on_error: bool,
    /// Abort once more than this many items have failed
    pub max_errors_before_abort: usize,
    /// Retries after the first attempt, for retryable errors only
    pub retry_attempts: u32,
    pub retry_base_delay: Duration,
    /// Hard limit per attempt
    pub item_timeout: Duration,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self::from_config(&BatchConfig::default())
    }
}

impl BatchOptions {
    pub fn from_config(config: &BatchConfig) -> Self {
        Self {
            max_concurrency: config.max_concurrency,
            continue_on_error: config.continue_on_error,
            max_errors_before_abort: config.max_errors_before_abort,
            retry_attempts: config.retry_attempts,
            retry_base_delay: Duration::from_millis(config.retry_base_delay_ms),
            item_timeout: Duration::from_millis(config.item_timeout_ms),
        }
    }

    /// Concurrency clamped to the supported range
    pub fn effective_concurrency(&self) -> usize {
        self.max_concurrency.clamp(MIN_CONCURRENCY, MAX_CONCURRENCY)
    }

    /// Delay before retry number `retry` (1-based): base * 2^(retry-1), capped
    pub fn backoff_delay(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(16);
        self.retry_base_delay
            .saturating_mul(1u32 << exponent)
            .min(MAX_RETRY_DELAY)
    }
}

/// What a successful item produced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ItemOutcome {
    Identified { result: MatchResult },
    Stored { outcome: StoreOutcome },
}

impl ItemOutcome {
    /// Terminal state for an item that produced this outcome
    pub fn terminal_state(&self) -> WorkItemState {
        match self {
            ItemOutcome::Stored { outcome } if outcome.is_duplicate() => WorkItemState::Skipped,
            _ => WorkItemState::Succeeded,
        }
    }
}

/// Per-batch counters beyond the state counts
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchStatistics {
    pub retries: u64,
    pub timeouts: u64,
    pub hash_matches: u64,
    pub text_fallback_matches: u64,
    pub embedding_matches: u64,
    pub ambiguous: u64,
    pub no_match: u64,
    pub inserted: u64,
    pub variants_inserted: u64,
    pub duplicates_rejected: u64,
}

impl BatchStatistics {
    pub fn record_outcome(&mut self, outcome: &ItemOutcome) {
        match outcome {
            ItemOutcome::Identified { result } => match &result.outcome {
                MatchOutcome::Matched { candidate } => match candidate.tier {
                    MatchTier::HashMatch => self.hash_matches += 1,
                    MatchTier::TextFallbackMatch => self.text_fallback_matches += 1,
                    MatchTier::EmbeddingMatch => self.embedding_matches += 1,
                },
                MatchOutcome::Ambiguous { .. } => self.ambiguous += 1,
                MatchOutcome::NoMatch => self.no_match += 1,
            },
            ItemOutcome::Stored { outcome } => match outcome {
                StoreOutcome::Inserted { .. } => self.inserted += 1,
                StoreOutcome::InsertedAsVariant { .. } => self.variants_inserted += 1,
                StoreOutcome::RejectedDuplicate { .. } => self.duplicates_rejected += 1,
            },
        }
    }
}

/// Live aggregate progress of a batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkProgress {
    pub batch_id: Uuid,
    pub total: usize,
    pub processing: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub cancelled: usize,
    pub current_file: Option<String>,
    pub started_at: DateTime<Utc>,
    pub elapsed: Duration,
    pub estimated_remaining: Option<Duration>,
    pub statistics: BatchStatistics,
}

impl BulkProgress {
    pub fn new(batch_id: Uuid, total: usize) -> Self {
        Self {
            batch_id,
            total,
            processing: 0,
            succeeded: 0,
            failed: 0,
            skipped: 0,
            cancelled: 0,
            current_file: None,
            started_at: Utc::now(),
            elapsed: Duration::ZERO,
            estimated_remaining: None,
            statistics: BatchStatistics::default(),
        }
    }

    /// Items in a terminal state
    pub fn completed(&self) -> usize {
        self.succeeded + self.failed + self.skipped + self.cancelled
    }

    pub fn pending(&self) -> usize {
        self.total.saturating_sub(self.completed() + self.processing)
    }

    pub fn percentage(&self) -> f32 {
        if self.total == 0 {
            return 100.0;
        }
        (self.completed() as f32 / self.total as f32) * 100.0
    }
}

/// Aggregate terminal-state counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchCounts {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub cancelled: usize,
}

impl BatchCounts {
    pub fn from_items<'a>(items: impl IntoIterator<Item = &'a BulkWorkItem>) -> Self {
        let mut counts = Self::default();
        for item in items {
            counts.total += 1;
            match item.state {
                WorkItemState::Succeeded => counts.succeeded += 1,
                WorkItemState::Failed => counts.failed += 1,
                WorkItemState::Skipped => counts.skipped += 1,
                WorkItemState::Cancelled => counts.cancelled += 1,
                WorkItemState::Pending | WorkItemState::Processing => {}
            }
        }
        counts
    }
}

/// Terminal report for one item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemReport {
    pub item: BulkWorkItem,
    pub outcome: Option<ItemOutcome>,
}

/// Result of `BatchProcessor::process`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchResult {
    pub batch_id: Uuid,
    /// One report per submitted item, in submission order
    pub items: Vec<ItemReport>,
    pub counts: BatchCounts,
    pub aborted: bool,
    pub abort_reason: Option<String>,
    pub duration: Duration,
    pub statistics: BatchStatistics,
}

impl BatchResult {
    /// Every item succeeded or was skipped, and nothing was aborted
    pub fn is_complete_success(&self) -> bool {
        !self.aborted
            && self.counts.failed == 0
            && self.counts.cancelled == 0
            && self.counts.succeeded + self.counts.skipped == self.counts.total
    }

    /// Some items succeeded but not all of them
    pub fn is_partial(&self) -> bool {
        !self.is_complete_success() && self.counts.succeeded + self.counts.skipped > 0
    }

    pub fn failures(&self) -> impl Iterator<Item = &ItemReport> {
        self.items
            .iter()
            .filter(|r| r.item.state == WorkItemState::Failed)
    }
}
