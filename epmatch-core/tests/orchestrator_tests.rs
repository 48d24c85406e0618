//! Match orchestrator integration tests
//!
//! Tier escalation, ambiguity, series hints and embedding degradation against
//! an in-memory store.

use epmatch_common::config::{FixedSettings, MatchSettings, SharedSettings};
use epmatch_common::db::init_memory_database;
use epmatch_common::SourceFormat;
use epmatch_core::models::TierStatus;
use epmatch_core::services::{EmbeddingError, EmbeddingProvider, IdentifyHints, MatchOrchestrator};
use epmatch_core::{ContentStore, EntryCandidate, EpisodeLabel, ItemError, MatchOutcome, MatchTier};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

const HARBOR: [&str; 12] = [
    "harbor", "lantern", "captain", "storm", "anchor", "compass", "rope", "tide", "gull",
    "mast", "sail", "deck",
];

const CONCERT: [&str; 12] = [
    "violin", "concert", "piano", "melody", "rhythm", "chorus", "stage", "tempo", "ballad",
    "sonata", "encore", "octave",
];

const MARKET: [&str; 12] = [
    "apple", "basket", "vendor", "coin", "bread", "cheese", "spice", "ledger", "wagon",
    "barrel", "honey", "flour",
];

/// Dialogue lines drawn from one vocabulary
fn dialogue_lines(words: &[&str; 12], lines: usize) -> Vec<String> {
    (0..lines)
        .map(|i| {
            format!(
                "{} {} {}",
                words[i % 12],
                words[(i * 5 + 1) % 12],
                words[(i * 7 + 2) % 12]
            )
        })
        .collect()
}

fn srt(lines: &[String], offset_secs: usize) -> String {
    lines
        .iter()
        .enumerate()
        .map(|(i, line)| {
            let start = offset_secs + i * 3;
            format!(
                "{}\n00:{:02}:{:02},000 --> 00:{:02}:{:02},500\n{}\n",
                i + 1,
                start / 60,
                start % 60,
                (start + 2) / 60,
                (start + 2) % 60,
                line
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn label(series: &str, episode: &str) -> EpisodeLabel {
    EpisodeLabel::new(series, "01", episode, None).unwrap()
}

async fn new_store() -> Arc<ContentStore> {
    Arc::new(ContentStore::new(init_memory_database().await.unwrap()))
}

fn orchestrator(store: &Arc<ContentStore>, settings: MatchSettings) -> MatchOrchestrator {
    MatchOrchestrator::new(Arc::clone(store), Arc::new(FixedSettings::new(settings)))
}

/// Settings where only an exact clean-text hash passes the hash tier
fn strict_hash_settings() -> MatchSettings {
    let mut settings = MatchSettings::default();
    settings.matching.text_based.fuzzy_hash_similarity = 100;
    settings
}

async fn identify(
    orchestrator: &MatchOrchestrator,
    text: &str,
    hints: &IdentifyHints,
) -> epmatch_core::MatchResult {
    orchestrator
        .identify(text, SourceFormat::TextBased, hints, &CancellationToken::new())
        .await
        .unwrap()
}

struct FixedProvider {
    vector: Vec<f32>,
    available: bool,
    calls: AtomicUsize,
}

impl FixedProvider {
    fn new(vector: Vec<f32>, available: bool) -> Self {
        Self {
            vector,
            available,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait::async_trait]
impl EmbeddingProvider for FixedProvider {
    fn name(&self) -> &str {
        "fixed-test-model"
    }

    fn dimension(&self) -> usize {
        self.vector.len()
    }

    fn is_available(&self) -> bool {
        self.available
    }

    async fn embed(&self, _text: &str) -> Result<Vec<f32>, EmbeddingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.vector.clone())
    }
}

#[tokio::test]
async fn test_exact_text_matches_in_hash_tier() {
    let store = new_store().await;
    let lines = dialogue_lines(&HARBOR, 40);
    store
        .store(EntryCandidate::new(label("Show", "01"), srt(&lines, 0), SourceFormat::TextBased))
        .await
        .unwrap();

    // Different timings, same dialogue
    let result = identify(
        &orchestrator(&store, MatchSettings::default()),
        &srt(&lines, 7),
        &IdentifyHints::default(),
    )
    .await;

    assert!(result.matched());
    assert_eq!(result.tier(), Some(MatchTier::HashMatch));
    assert_eq!(result.confidence(), Some(1.0));
    assert!(result.rename_eligible);
    // Later tiers never ran
    assert_eq!(result.tier_timings.len(), 1);
    assert_eq!(result.total_elapsed, result.tier_timings[0].elapsed);
}

#[tokio::test]
async fn test_reordered_lines_fall_back_to_text_tier() {
    let store = new_store().await;
    let lines = dialogue_lines(&HARBOR, 40);
    store
        .store(EntryCandidate::new(label("Show", "01"), lines.join("\n"), SourceFormat::TextBased))
        .await
        .unwrap();
    store
        .store(EntryCandidate::new(
            label("Show", "02"),
            dialogue_lines(&CONCERT, 40).join("\n"),
            SourceFormat::TextBased,
        ))
        .await
        .unwrap();

    let reversed: Vec<String> = lines.iter().rev().cloned().collect();
    let result = identify(
        &orchestrator(&store, strict_hash_settings()),
        &reversed.join("\n"),
        &IdentifyHints::default(),
    )
    .await;

    assert!(result.matched(), "got {:?}", result.outcome);
    assert_eq!(result.tier(), Some(MatchTier::TextFallbackMatch));
    let candidate = result.candidate().unwrap();
    assert_eq!(candidate.label.episode, "01");
    assert_eq!(candidate.scores.text_similarity, Some(100.0));

    let hash_timing = result.timing(MatchTier::HashMatch).unwrap();
    assert_eq!(hash_timing.status, TierStatus::BelowThreshold);
}

#[tokio::test]
async fn test_same_dialogue_in_two_episodes_is_ambiguous() {
    let store = new_store().await;
    let lines = dialogue_lines(&HARBOR, 30);
    // Same words, different cue timings: distinct composite keys
    store
        .store(EntryCandidate::new(label("Show", "04"), srt(&lines, 0), SourceFormat::TextBased))
        .await
        .unwrap();
    store
        .store(EntryCandidate::new(label("Show", "05"), srt(&lines, 90), SourceFormat::TextBased))
        .await
        .unwrap();

    let result = identify(
        &orchestrator(&store, MatchSettings::default()),
        &lines.join("\n"),
        &IdentifyHints::default(),
    )
    .await;

    match &result.outcome {
        MatchOutcome::Ambiguous { candidates } => {
            assert_eq!(candidates.len(), 2);
            assert!(candidates.iter().all(|c| c.tier == MatchTier::HashMatch));
        }
        other => panic!("Expected Ambiguous, got {:?}", other),
    }
    assert!(!result.rename_eligible);
}

#[tokio::test]
async fn test_series_hint_resolves_cross_series_tie() {
    let store = new_store().await;
    let lines = dialogue_lines(&HARBOR, 40);
    let mut longer = lines.clone();
    longer.push("harbor lantern captain".to_string());

    store
        .store(EntryCandidate::new(label("Show", "01"), lines.join("\n"), SourceFormat::TextBased))
        .await
        .unwrap();
    store
        .store(EntryCandidate::new(label("Other", "01"), longer.join("\n"), SourceFormat::TextBased))
        .await
        .unwrap();

    let orchestrator = orchestrator(&store, strict_hash_settings());
    let query: Vec<String> = lines.iter().rev().cloned().collect();
    let query = query.join("\n");

    let unhinted = identify(&orchestrator, &query, &IdentifyHints::default()).await;
    assert!(unhinted.ambiguous(), "got {:?}", unhinted.outcome);

    let hinted = identify(&orchestrator, &query, &IdentifyHints::with_series("show")).await;
    assert!(hinted.matched(), "got {:?}", hinted.outcome);
    assert_eq!(hinted.candidate().unwrap().label.series, "Show");
}

#[tokio::test]
async fn test_embedding_tier_skipped_without_model() {
    let store = new_store().await;
    store
        .store(EntryCandidate::new(
            label("Show", "01"),
            dialogue_lines(&HARBOR, 40).join("\n"),
            SourceFormat::TextBased,
        ))
        .await
        .unwrap();

    let provider = Arc::new(FixedProvider::new(vec![1.0, 0.0, 0.0], false));
    let orchestrator = orchestrator(&store, MatchSettings::default())
        .with_embedding_provider(Arc::clone(&provider) as Arc<dyn EmbeddingProvider>);

    let result = identify(
        &orchestrator,
        &dialogue_lines(&MARKET, 40).join("\n"),
        &IdentifyHints::default(),
    )
    .await;

    assert_eq!(result.outcome, MatchOutcome::NoMatch);
    assert_eq!(result.tier_timings.len(), 3);
    let embedding = result.timing(MatchTier::EmbeddingMatch).unwrap();
    assert!(matches!(embedding.status, TierStatus::Skipped { .. }));
    assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_embedding_tier_matches_nearest_vector() {
    let store = new_store().await;
    store
        .store(
            EntryCandidate::new(
                label("Show", "01"),
                dialogue_lines(&HARBOR, 40).join("\n"),
                SourceFormat::TextBased,
            )
            .with_embedding(vec![1.0, 0.0, 0.0]),
        )
        .await
        .unwrap();
    store
        .store(
            EntryCandidate::new(
                label("Show", "02"),
                dialogue_lines(&CONCERT, 40).join("\n"),
                SourceFormat::TextBased,
            )
            .with_embedding(vec![0.0, 1.0, 0.0]),
        )
        .await
        .unwrap();

    let provider = Arc::new(FixedProvider::new(vec![0.9, 0.1, 0.0], true));
    let orchestrator = orchestrator(&store, MatchSettings::default())
        .with_embedding_provider(Arc::clone(&provider) as Arc<dyn EmbeddingProvider>);

    let result = identify(
        &orchestrator,
        &dialogue_lines(&MARKET, 40).join("\n"),
        &IdentifyHints::default(),
    )
    .await;

    assert!(result.matched(), "got {:?}", result.outcome);
    assert_eq!(result.tier(), Some(MatchTier::EmbeddingMatch));
    let candidate = result.candidate().unwrap();
    assert_eq!(candidate.label.episode, "01");
    assert!(candidate.confidence > 0.95);
    assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_precomputed_vector_used_without_provider() {
    let store = new_store().await;
    store
        .store(
            EntryCandidate::new(
                label("Show", "09"),
                dialogue_lines(&CONCERT, 20).join("\n"),
                SourceFormat::TextBased,
            )
            .with_embedding(vec![0.0, 0.0, 1.0]),
        )
        .await
        .unwrap();

    let hints = IdentifyHints {
        embedding: Some(vec![0.0, 0.05, 1.0]),
        ..IdentifyHints::default()
    };
    let result = identify(
        &orchestrator(&store, MatchSettings::default()),
        &dialogue_lines(&MARKET, 20).join("\n"),
        &hints,
    )
    .await;

    assert_eq!(result.tier(), Some(MatchTier::EmbeddingMatch));
    assert_eq!(result.candidate().unwrap().label.episode, "09");
}

#[tokio::test]
async fn test_earlier_tier_wins_over_later_tier() {
    let store = new_store().await;
    let lines = dialogue_lines(&HARBOR, 40);
    store
        .store(
            EntryCandidate::new(label("Show", "01"), lines.join("\n"), SourceFormat::TextBased)
                .with_embedding(vec![0.0, 1.0]),
        )
        .await
        .unwrap();
    store
        .store(
            EntryCandidate::new(
                label("Show", "02"),
                dialogue_lines(&CONCERT, 40).join("\n"),
                SourceFormat::TextBased,
            )
            .with_embedding(vec![1.0, 0.0]),
        )
        .await
        .unwrap();

    // The embedding would point at episode 02 with a perfect score
    let provider = Arc::new(FixedProvider::new(vec![1.0, 0.0], true));
    let orchestrator = orchestrator(&store, MatchSettings::default())
        .with_embedding_provider(Arc::clone(&provider) as Arc<dyn EmbeddingProvider>);

    let result = identify(&orchestrator, &lines.join("\n"), &IdentifyHints::default()).await;

    assert_eq!(result.tier(), Some(MatchTier::HashMatch));
    assert_eq!(result.candidate().unwrap().label.episode, "01");
    assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_empty_store_and_empty_text() {
    let store = new_store().await;
    let orchestrator = orchestrator(&store, MatchSettings::default());

    let result = identify(&orchestrator, "Anything at all", &IdentifyHints::default()).await;
    assert_eq!(result.outcome, MatchOutcome::NoMatch);
    assert_eq!(
        result.timing(MatchTier::HashMatch).unwrap().status,
        TierStatus::NoCandidates
    );

    let empty = identify(&orchestrator, "  \n ", &IdentifyHints::default()).await;
    assert_eq!(empty.outcome, MatchOutcome::NoMatch);
    assert!(empty.tier_timings.is_empty());
}

#[tokio::test]
async fn test_cancelled_request_returns_cancelled() {
    let store = new_store().await;
    let orchestrator = orchestrator(&store, MatchSettings::default());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = orchestrator
        .identify("Some text", SourceFormat::TextBased, &IdentifyHints::default(), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, ItemError::Cancelled));
}

#[tokio::test]
async fn test_settings_snapshot_read_per_request() {
    let store = new_store().await;
    let lines = dialogue_lines(&HARBOR, 40);
    store
        .store(EntryCandidate::new(label("Show", "01"), lines.join("\n"), SourceFormat::TextBased))
        .await
        .unwrap();

    let settings = Arc::new(SharedSettings::new(MatchSettings::default()));
    let orchestrator = MatchOrchestrator::new(Arc::clone(&store), settings.clone());
    let mut reordered = lines.clone();
    reordered.swap(0, 39);
    reordered.swap(5, 20);
    let query = reordered.join("\n");

    let mut strict = MatchSettings::default();
    strict.matching.text_based.fuzzy_hash_similarity = 100;
    strict.matching.text_based.match_confidence = 1.0;
    strict.matching.text_based.rename_confidence = 1.0;
    settings.replace(strict).unwrap();

    let result = identify(&orchestrator, &query, &IdentifyHints::default()).await;
    assert_eq!(result.tier(), Some(MatchTier::TextFallbackMatch));
    assert!(result.rename_eligible);
}
