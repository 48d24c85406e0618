//! Batch processor integration tests
//!
//! Uses a scripted handler whose behaviour is chosen by the file name, plus
//! the real identify/store handlers over temporary files.

use epmatch_common::config::{FixedSettings, MatchSettings};
use epmatch_common::db::init_memory_database;
use epmatch_common::events::{EpmatchEvent, EventBus};
use epmatch_core::error::ItemErrorKind;
use epmatch_core::models::{BulkProgress, BulkWorkItem, ItemOutcome, WorkItemState};
use epmatch_core::services::{
    BatchProcessor, EntrySource, IdentifyHandler, ItemStep, MappedEntrySource, PlainTextSource,
    ProgressSink, StoreHandler, WorkHandler,
};
use epmatch_core::{
    BatchOptions, ContentStore, EntryCandidate, EpisodeLabel, ItemError, MatchOrchestrator, MatchTier,
    StoreOutcome,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Behaviour keyed by file-name prefix:
/// `ok`, `dup`, `flaky` (one transient failure), `transient` (always),
/// `invalid`, `slow` (sleeps past any test timeout)
#[derive(Default)]
struct ScriptedHandler {
    attempts: Mutex<HashMap<PathBuf, Vec<Instant>>>,
}

impl ScriptedHandler {
    fn attempts_for(&self, path: &str) -> Vec<Instant> {
        self.attempts
            .lock()
            .unwrap()
            .get(Path::new(path))
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl WorkHandler for ScriptedHandler {
    fn operation(&self) -> &'static str {
        "store"
    }

    async fn handle(
        &self,
        item: &BulkWorkItem,
        _cancel: &CancellationToken,
    ) -> Result<ItemStep, ItemError> {
        let attempt = {
            let mut attempts = self.attempts.lock().unwrap();
            let seen = attempts.entry(item.path.clone()).or_default();
            seen.push(Instant::now());
            seen.len()
        };

        let name = item.display_path();
        let entry_id = Uuid::from_u128(item.index as u128 + 1);
        let stored = |outcome| Ok(ItemStep::from(ItemOutcome::Stored { outcome }));

        if name.starts_with("ok") {
            stored(StoreOutcome::Inserted { entry_id })
        } else if name.starts_with("dup") {
            stored(StoreOutcome::RejectedDuplicate {
                existing_entry_id: entry_id,
            })
        } else if name.starts_with("flaky") {
            if attempt == 1 {
                Err(ItemError::TransientIo("connection reset".to_string()))
            } else {
                stored(StoreOutcome::Inserted { entry_id })
            }
        } else if name.starts_with("transient") {
            Err(ItemError::TransientIo("device busy".to_string()))
        } else if name.starts_with("slow") {
            tokio::time::sleep(Duration::from_secs(30)).await;
            stored(StoreOutcome::Inserted { entry_id })
        } else {
            Err(ItemError::Validation(format!("{}: unreadable subtitle", name)))
        }
    }
}

fn paths(names: &[&str]) -> Vec<PathBuf> {
    names.iter().map(PathBuf::from).collect()
}

fn fast_options() -> BatchOptions {
    BatchOptions {
        max_concurrency: 4,
        continue_on_error: true,
        max_errors_before_abort: 100,
        retry_attempts: 2,
        retry_base_delay: Duration::from_millis(1),
        item_timeout: Duration::from_secs(5),
    }
}

async fn run(options: BatchOptions, names: &[&str]) -> (epmatch_core::BatchResult, Arc<ScriptedHandler>) {
    let handler = Arc::new(ScriptedHandler::default());
    let result = BatchProcessor::new(options)
        .process(
            Arc::clone(&handler) as Arc<dyn WorkHandler>,
            paths(names),
            None,
            CancellationToken::new(),
        )
        .await;
    (result, handler)
}

fn state_of(result: &epmatch_core::BatchResult, index: usize) -> WorkItemState {
    result.items[index].item.state
}

#[tokio::test]
async fn test_same_outcomes_at_any_concurrency() {
    let names: Vec<String> = (0..24)
        .map(|i| match i % 6 {
            0 => format!("ok-{}.srt", i),
            1 => format!("dup-{}.srt", i),
            2 => format!("flaky-{}.srt", i),
            3 => format!("transient-{}.srt", i),
            4 => format!("invalid-{}.srt", i),
            _ => format!("ok-late-{}.srt", i),
        })
        .collect();
    let names: Vec<&str> = names.iter().map(String::as_str).collect();

    let (serial, _) = run(
        BatchOptions {
            max_concurrency: 1,
            ..fast_options()
        },
        &names,
    )
    .await;
    let (parallel, _) = run(
        BatchOptions {
            max_concurrency: 8,
            ..fast_options()
        },
        &names,
    )
    .await;

    let summary = |result: &epmatch_core::BatchResult| {
        result
            .items
            .iter()
            .map(|r| (r.item.path.clone(), r.item.state, r.item.attempt, r.outcome.clone()))
            .collect::<Vec<_>>()
    };

    assert_eq!(summary(&serial), summary(&parallel));
    assert_eq!(serial.counts, parallel.counts);
    assert_eq!(serial.statistics, parallel.statistics);

    assert_eq!(serial.counts.total, 24);
    assert_eq!(serial.counts.succeeded, 12);
    assert_eq!(serial.counts.skipped, 4);
    assert_eq!(serial.counts.failed, 8);
    assert!(serial.is_partial());
    assert!(!serial.aborted);
}

#[tokio::test]
async fn test_transient_failure_retried_with_growing_delay() {
    let base = Duration::from_millis(20);
    let (result, handler) = run(
        BatchOptions {
            retry_attempts: 3,
            retry_base_delay: base,
            ..fast_options()
        },
        &["transient.srt"],
    )
    .await;

    let item = &result.items[0].item;
    assert_eq!(item.state, WorkItemState::Failed);
    assert_eq!(item.attempt, 4);
    assert_eq!(item.error_kind, Some(ItemErrorKind::RetryExhausted));
    assert_eq!(result.statistics.retries, 3);

    let times = handler.attempts_for("transient.srt");
    assert_eq!(times.len(), 4);
    for (i, pair) in times.windows(2).enumerate() {
        let gap = pair[1] - pair[0];
        assert!(gap >= base * (1u32 << i), "gap {} was {:?}", i, gap);
    }
}

#[tokio::test]
async fn test_validation_failure_never_retried() {
    let (result, handler) = run(fast_options(), &["invalid.srt"]).await;

    let item = &result.items[0].item;
    assert_eq!(item.state, WorkItemState::Failed);
    assert_eq!(item.attempt, 1);
    assert_eq!(item.error_kind, Some(ItemErrorKind::Validation));
    assert_eq!(result.statistics.retries, 0);
    assert_eq!(handler.attempts_for("invalid.srt").len(), 1);
}

#[tokio::test]
async fn test_flaky_item_succeeds_on_retry() {
    let (result, _) = run(fast_options(), &["flaky.srt"]).await;

    let item = &result.items[0].item;
    assert_eq!(item.state, WorkItemState::Succeeded);
    assert_eq!(item.attempt, 2);
    // The retried error stays on record
    assert_eq!(item.error_kind, Some(ItemErrorKind::TransientIo));
    assert!(result.is_complete_success());
}

#[tokio::test]
async fn test_stop_on_first_error() {
    let (result, _) = run(
        BatchOptions {
            max_concurrency: 1,
            continue_on_error: false,
            ..fast_options()
        },
        &["ok-1.srt", "invalid.srt", "ok-2.srt", "ok-3.srt"],
    )
    .await;

    assert!(result.aborted);
    assert!(result.abort_reason.as_deref().unwrap().contains("continue_on_error"));
    assert_eq!(state_of(&result, 0), WorkItemState::Succeeded);
    assert_eq!(state_of(&result, 1), WorkItemState::Failed);
    assert_eq!(state_of(&result, 2), WorkItemState::Cancelled);
    assert_eq!(state_of(&result, 3), WorkItemState::Cancelled);
    assert!(result.is_partial());
    assert!(!result.is_complete_success());
    assert_eq!(result.failures().count(), 1);
}

#[tokio::test]
async fn test_abort_after_max_errors() {
    let (result, _) = run(
        BatchOptions {
            max_concurrency: 1,
            max_errors_before_abort: 1,
            ..fast_options()
        },
        &["invalid-1.srt", "invalid-2.srt", "ok-1.srt", "ok-2.srt"],
    )
    .await;

    assert!(result.aborted);
    assert_eq!(result.counts.failed, 2);
    assert_eq!(result.counts.cancelled, 2);
    assert_eq!(result.counts.succeeded, 0);
}

#[tokio::test]
async fn test_timeout_is_retryable_failure() {
    let (result, handler) = run(
        BatchOptions {
            retry_attempts: 1,
            item_timeout: Duration::from_millis(50),
            ..fast_options()
        },
        &["slow.srt", "ok.srt"],
    )
    .await;

    let slow = &result.items[0].item;
    assert_eq!(slow.state, WorkItemState::Failed);
    assert_eq!(slow.attempt, 2);
    assert_eq!(slow.error_kind, Some(ItemErrorKind::RetryExhausted));
    assert_eq!(result.statistics.timeouts, 2);
    assert_eq!(handler.attempts_for("slow.srt").len(), 2);

    // The stuck item does not hold up its sibling
    assert_eq!(state_of(&result, 1), WorkItemState::Succeeded);
}

#[tokio::test]
async fn test_caller_cancellation_mid_batch() {
    let handler = Arc::new(ScriptedHandler::default());
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let result = BatchProcessor::new(BatchOptions {
        max_concurrency: 2,
        item_timeout: Duration::from_secs(60),
        ..fast_options()
    })
    .process(
        handler,
        paths(&["slow-1.srt", "slow-2.srt", "slow-3.srt"]),
        None,
        cancel,
    )
    .await;

    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(result.counts.cancelled, 3);
    assert!(result.aborted);
    assert_eq!(result.abort_reason.as_deref(), Some("cancelled by caller"));
}

#[tokio::test]
async fn test_progress_sink_sees_every_completion() {
    let seen: Arc<Mutex<Vec<BulkProgress>>> = Arc::new(Mutex::new(Vec::new()));
    let collector = Arc::clone(&seen);
    let sink: Arc<dyn ProgressSink> = Arc::new(move |progress: BulkProgress| {
        collector.lock().unwrap().push(progress);
    });

    let names = ["ok-1.srt", "dup-1.srt", "invalid-1.srt", "ok-2.srt", "flaky-1.srt"];
    let result = BatchProcessor::new(fast_options())
        .process(
            Arc::new(ScriptedHandler::default()),
            paths(&names),
            Some(sink),
            CancellationToken::new(),
        )
        .await;

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), names.len());
    let completed: Vec<usize> = seen.iter().map(|p| p.completed()).collect();
    let mut sorted = completed.clone();
    sorted.sort_unstable();
    assert_eq!(sorted, vec![1, 2, 3, 4, 5]);

    let last = seen.iter().max_by_key(|p| p.completed()).unwrap();
    assert_eq!(last.succeeded, result.counts.succeeded);
    assert_eq!(last.skipped, 1);
    assert_eq!(last.failed, 1);
    assert_eq!(last.percentage(), 100.0);
}

#[tokio::test]
async fn test_event_bus_sink_publishes_lifecycle() {
    let bus = EventBus::new(64);
    let mut rx = bus.subscribe();

    let result = BatchProcessor::new(fast_options())
        .process(
            Arc::new(ScriptedHandler::default()),
            paths(&["ok-1.srt", "invalid.srt"]),
            Some(Arc::new(bus.clone())),
            CancellationToken::new(),
        )
        .await;

    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }

    assert!(matches!(
        events.first(),
        Some(EpmatchEvent::BatchStarted { total_items: 2, operation, .. }) if operation == "store"
    ));
    let item_events = events
        .iter()
        .filter(|e| matches!(e, EpmatchEvent::BatchItemCompleted { .. }))
        .count();
    assert_eq!(item_events, 2);
    match events.last() {
        Some(EpmatchEvent::BatchCompleted {
            batch_id,
            succeeded,
            failed,
            ..
        }) => {
            assert_eq!(*batch_id, result.batch_id);
            assert_eq!(*succeeded, 1);
            assert_eq!(*failed, 1);
        }
        other => panic!("Unexpected last event: {:?}", other),
    }
}

#[tokio::test]
async fn test_store_then_identify_files() {
    let dir = TempDir::new().unwrap();
    let pool = init_memory_database().await.unwrap();
    let store = Arc::new(ContentStore::new(pool));

    let episode_one = dir.path().join("show.s01e01.srt");
    let episode_two = dir.path().join("show.s01e02.srt");
    let copy_of_one = dir.path().join("show.s01e01.copy.srt");
    let not_subtitle = dir.path().join("show.s01e03.mkv");
    std::fs::write(
        &episode_one,
        "1\n00:00:01,000 --> 00:00:03,000\nWe sail at dawn, captain.\n\n2\n00:00:04,000 --> 00:00:06,000\nThe storm will not wait for us.\n",
    )
    .unwrap();
    std::fs::write(
        &episode_two,
        "1\n00:00:01,000 --> 00:00:03,000\nThe orchestra tunes before the concert.\n\n2\n00:00:04,000 --> 00:00:06,000\nPlay the sonata one more time.\n",
    )
    .unwrap();
    std::fs::copy(&episode_one, &copy_of_one).unwrap();
    std::fs::write(&not_subtitle, "binary").unwrap();

    let mut labels = HashMap::new();
    labels.insert(episode_one.clone(), EpisodeLabel::new("Show", "1", "1", None).unwrap());
    labels.insert(episode_two.clone(), EpisodeLabel::new("Show", "1", "2", None).unwrap());
    labels.insert(copy_of_one.clone(), EpisodeLabel::new("Show", "1", "1", None).unwrap());

    let store_handler = Arc::new(StoreHandler::new(
        Arc::clone(&store),
        Arc::new(MappedEntrySource::new(labels)),
    ));
    let stored = BatchProcessor::new(BatchOptions {
        max_concurrency: 1,
        ..fast_options()
    })
    .process(
        store_handler,
        vec![episode_one.clone(), episode_two.clone(), copy_of_one.clone()],
        None,
        CancellationToken::new(),
    )
    .await;

    assert_eq!(stored.counts.succeeded, 2);
    assert_eq!(stored.counts.skipped, 1);
    assert_eq!(stored.statistics.duplicates_rejected, 1);
    assert_eq!(store.count().await.unwrap(), 2);

    let orchestrator = Arc::new(MatchOrchestrator::new(
        Arc::clone(&store),
        Arc::new(FixedSettings::new(MatchSettings::default())),
    ));
    let identify_handler = Arc::new(IdentifyHandler::new(
        orchestrator,
        Arc::new(PlainTextSource::new()),
    ));
    let identified = BatchProcessor::new(fast_options())
        .process(
            identify_handler,
            vec![episode_two.clone(), episode_one.clone(), not_subtitle.clone()],
            None,
            CancellationToken::new(),
        )
        .await;

    assert_eq!(identified.counts.succeeded, 2);
    assert_eq!(identified.counts.failed, 1);
    assert_eq!(identified.statistics.hash_matches, 2);

    let episodes: Vec<String> = identified.items[..2]
        .iter()
        .map(|report| match &report.outcome {
            Some(ItemOutcome::Identified { result }) => {
                assert_eq!(result.tier(), Some(MatchTier::HashMatch));
                result.candidate().unwrap().label.episode.clone()
            }
            other => panic!("Unexpected outcome: {:?}", other),
        })
        .collect();
    assert_eq!(episodes, vec!["02".to_string(), "01".to_string()]);

    let rejected = &identified.items[2].item;
    assert_eq!(rejected.attempt, 1);
    assert_eq!(rejected.error_kind, Some(ItemErrorKind::Validation));
}

/// Reads entries through a map, holding back files whose name starts with `a`
struct LaggingEntrySource {
    inner: MappedEntrySource,
    lag: Duration,
}

#[async_trait::async_trait]
impl EntrySource for LaggingEntrySource {
    async fn read_entry(&self, path: &Path) -> Result<EntryCandidate, ItemError> {
        let lagging = path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.starts_with('a'));
        if lagging {
            tokio::time::sleep(self.lag).await;
        }
        self.inner.read_entry(path).await
    }
}

fn store_kind(report: &epmatch_core::models::ItemReport) -> &'static str {
    match &report.outcome {
        Some(ItemOutcome::Stored { outcome }) => match outcome {
            StoreOutcome::Inserted { .. } => "inserted",
            StoreOutcome::InsertedAsVariant { .. } => "variant",
            StoreOutcome::RejectedDuplicate { .. } => "duplicate",
        },
        _ => "none",
    }
}

#[tokio::test]
async fn test_store_batch_same_outcomes_at_any_concurrency() {
    let dir = TempDir::new().unwrap();
    let first = dir.path().join("a-first.srt");
    let same_as_first = dir.path().join("b-same.srt");
    let variant = dir.path().join("c-variant.srt");
    let other_episode = dir.path().join("d-other.srt");
    std::fs::write(
        &first,
        "1\n00:00:01,000 --> 00:00:03,000\nThe harbor lights flicker at dusk.\n\n2\n00:00:04,000 --> 00:00:06,000\nRaise the anchor and trim the sails.\n",
    )
    .unwrap();
    std::fs::copy(&first, &same_as_first).unwrap();
    std::fs::write(
        &variant,
        "1\n00:00:01,000 --> 00:00:03,000\nMarket stalls open before sunrise.\n\n2\n00:00:04,000 --> 00:00:06,000\nFresh bread and ripe melons for sale.\n",
    )
    .unwrap();
    std::fs::write(
        &other_episode,
        "1\n00:00:01,000 --> 00:00:03,000\nThe violins rehearse the overture.\n\n2\n00:00:04,000 --> 00:00:06,000\nThe conductor lifts the baton slowly.\n",
    )
    .unwrap();

    let episode_one = EpisodeLabel::new("Show", "1", "1", None).unwrap();
    let mut labels = HashMap::new();
    labels.insert(first.clone(), episode_one.clone());
    labels.insert(same_as_first.clone(), episode_one.clone());
    labels.insert(variant.clone(), episode_one);
    labels.insert(other_episode.clone(), EpisodeLabel::new("Show", "1", "2", None).unwrap());

    let files = vec![first, same_as_first, variant, other_episode];

    let mut runs = Vec::new();
    for max_concurrency in [1, 8] {
        let store = Arc::new(ContentStore::new(init_memory_database().await.unwrap()));
        let handler = Arc::new(StoreHandler::new(
            Arc::clone(&store),
            Arc::new(LaggingEntrySource {
                inner: MappedEntrySource::new(labels.clone()),
                lag: Duration::from_millis(100),
            }),
        ));
        let result = BatchProcessor::new(BatchOptions {
            max_concurrency,
            ..fast_options()
        })
        .process(handler, files.clone(), None, CancellationToken::new())
        .await;

        assert_eq!(store.count().await.unwrap(), 3);
        let states: Vec<WorkItemState> = result.items.iter().map(|r| r.item.state).collect();
        let kinds: Vec<&str> = result.items.iter().map(store_kind).collect();
        runs.push((states, kinds));
    }

    assert_eq!(runs[0], runs[1]);
    assert_eq!(
        runs[0].0,
        vec![
            WorkItemState::Succeeded,
            WorkItemState::Skipped,
            WorkItemState::Succeeded,
            WorkItemState::Succeeded,
        ]
    );
    assert_eq!(runs[0].1, vec!["inserted", "duplicate", "variant", "inserted"]);
}
