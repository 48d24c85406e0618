//! Match orchestrator
//!
//! One pass per identify request:
//!
//! ```text
//! Start -> HashTier -> TextFallbackTier -> EmbeddingTier -> NoMatch
//!             |              |                  |
//!          Matched /      Matched /          Matched /
//!          Ambiguous      Ambiguous          Ambiguous
//! ```
//!
//! Each tier has its own per-format threshold. The first tier that accepts a
//! candidate (or finds several within the ambiguity epsilon) ends the pass,
//! so an earlier tier wins even if a later one would have scored higher.

use crate::error::ItemError;
use crate::models::{
    CompositeHashKey, MatchCandidate, MatchOutcome, MatchResult, MatchTier, TextVariants,
    TierScores, TierStatus, TierTiming,
};
use crate::services::content_store::{parse_digests, ContentStore, HashRow};
use crate::services::embedding_matcher::{
    EmbeddingError, EmbeddingMatcher, EmbeddingProvider, EmbeddingScope,
};
use crate::services::fuzzy_hash::{self, FuzzyDigest};
use crate::services::text_fallback_matcher::{
    select_series, sort_candidates, FallbackScope, TextFallbackMatcher,
};
use crate::services::text_normalizer;
use epmatch_common::{Error, SettingsProvider, SourceFormat, SubtitleTypeThresholds};
use rayon::prelude::*;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Nearest neighbours fetched by the embedding tier
const EMBEDDING_SEARCH_LIMIT: usize = 16;

/// Float slack when comparing confidence gaps against the epsilon
const EPSILON_SLACK: f32 = 1e-6;

/// Optional context supplied with an identify request
#[derive(Debug, Clone, Default)]
pub struct IdentifyHints {
    /// Series name, typically parsed from the filename
    pub series: Option<String>,
    pub season: Option<String>,
    /// Precomputed embedding of the text
    pub embedding: Option<Vec<f32>>,
}

impl IdentifyHints {
    pub fn with_series(series: impl Into<String>) -> Self {
        Self {
            series: Some(series.into()),
            ..Self::default()
        }
    }
}

/// Decision of one tier
#[derive(Debug, Clone, PartialEq)]
pub enum TierDecision {
    Accepted(MatchCandidate),
    Ambiguous(Vec<MatchCandidate>),
    BelowThreshold { best_confidence: f32 },
    NoCandidates,
}

impl TierDecision {
    fn status(&self) -> TierStatus {
        match self {
            TierDecision::Accepted(_) => TierStatus::Accepted,
            TierDecision::Ambiguous(_) => TierStatus::Ambiguous,
            TierDecision::BelowThreshold { .. } => TierStatus::BelowThreshold,
            TierDecision::NoCandidates => TierStatus::NoCandidates,
        }
    }

    fn best_confidence(&self) -> Option<f32> {
        match self {
            TierDecision::Accepted(c) => Some(c.confidence),
            TierDecision::Ambiguous(cs) => cs.first().map(|c| c.confidence),
            TierDecision::BelowThreshold { best_confidence } => Some(*best_confidence),
            TierDecision::NoCandidates => None,
        }
    }

    fn into_outcome(self) -> Option<MatchOutcome> {
        match self {
            TierDecision::Accepted(candidate) => Some(MatchOutcome::Matched { candidate }),
            TierDecision::Ambiguous(candidates) => Some(MatchOutcome::Ambiguous { candidates }),
            TierDecision::BelowThreshold { .. } | TierDecision::NoCandidates => None,
        }
    }
}

/// Candidates at or above `threshold`
///
/// Lowering the threshold can only grow this set.
pub fn accept_candidates(candidates: &[MatchCandidate], threshold: f32) -> Vec<MatchCandidate> {
    candidates
        .iter()
        .filter(|c| c.confidence >= threshold)
        .cloned()
        .collect()
}

/// Apply a tier's threshold and the ambiguity rule
///
/// Variants of the same episode collapse to their best candidate first:
/// two tracks of one episode are not an ambiguity.
pub fn evaluate_tier(candidates: Vec<MatchCandidate>, threshold: f32, epsilon: f32) -> TierDecision {
    let candidates = sort_candidates(candidates);
    let Some(best) = candidates.first() else {
        return TierDecision::NoCandidates;
    };
    let best_confidence = best.confidence;

    let accepted = accept_candidates(&candidates, threshold);
    if accepted.is_empty() {
        return TierDecision::BelowThreshold { best_confidence };
    }

    let mut seen = HashSet::new();
    let collapsed: Vec<MatchCandidate> = accepted
        .into_iter()
        .filter(|c| {
            seen.insert((
                c.label.series.clone(),
                c.label.season.clone(),
                c.label.episode.clone(),
            ))
        })
        .collect();

    let top = collapsed[0].confidence;
    let mut close: Vec<MatchCandidate> = collapsed
        .into_iter()
        .take_while(|c| top - c.confidence <= epsilon + EPSILON_SLACK)
        .collect();

    if close.len() > 1 {
        TierDecision::Ambiguous(close)
    } else {
        TierDecision::Accepted(close.remove(0))
    }
}

struct PreparedQuery {
    texts: TextVariants,
    digests: [Option<FuzzyDigest>; 4],
}

async fn prepare_query(text: String) -> Result<PreparedQuery, ItemError> {
    tokio::task::spawn_blocking(move || {
        let texts = text_normalizer::normalize(&text);
        let key = CompositeHashKey {
            original: fuzzy_hash::hash(&texts.original),
            no_timecodes: fuzzy_hash::hash(&texts.no_timecodes),
            no_html: fuzzy_hash::hash(&texts.no_html),
            clean: fuzzy_hash::hash(&texts.clean),
        };
        PreparedQuery {
            digests: parse_digests(&key),
            texts,
        }
    })
    .await
    .map_err(|e| ItemError::Store(Error::Internal(format!("Query hashing task failed: {}", e))))
}

/// Runs the three tiers for identify requests
pub struct MatchOrchestrator {
    store: Arc<ContentStore>,
    text_matcher: TextFallbackMatcher,
    embedding_matcher: EmbeddingMatcher,
    settings: Arc<dyn SettingsProvider>,
}

impl MatchOrchestrator {
    pub fn new(store: Arc<ContentStore>, settings: Arc<dyn SettingsProvider>) -> Self {
        Self {
            text_matcher: TextFallbackMatcher::new(Arc::clone(&store)),
            embedding_matcher: EmbeddingMatcher::new(Arc::clone(&store), None),
            store,
            settings,
        }
    }

    pub fn with_embedding_provider(mut self, provider: Arc<dyn EmbeddingProvider>) -> Self {
        self.embedding_matcher = EmbeddingMatcher::new(Arc::clone(&self.store), Some(provider));
        self
    }

    pub fn store(&self) -> &Arc<ContentStore> {
        &self.store
    }

    /// Identify the episode a subtitle text belongs to
    ///
    /// "No match" and "ambiguous" are returned as outcomes. Errors are store
    /// failures or cancellation.
    pub async fn identify(
        &self,
        text: &str,
        source_format: SourceFormat,
        hints: &IdentifyHints,
        cancel: &CancellationToken,
    ) -> Result<MatchResult, ItemError> {
        let settings = self.settings.snapshot();
        let thresholds = *settings.thresholds(source_format);
        let epsilon = settings.matching.ambiguity_epsilon;

        let query = prepare_query(text.to_string()).await?;
        if query.texts.is_empty() {
            debug!(source_format = %source_format, "Empty query text, nothing to match");
            return Ok(MatchResult::no_match(source_format));
        }

        let mut timings: Vec<TierTiming> = Vec::with_capacity(3);

        // Hash tier
        check_cancel(cancel)?;
        let started = Instant::now();
        let rows = self.store.hash_rows().await?;
        let scores = self.score_rows(&rows, &query, cancel).await?;
        let decision = hash_tier_decision(&rows, &scores, &thresholds, epsilon);
        record(&mut timings, MatchTier::HashMatch, &decision, started.elapsed());
        let mut outcome = decision.into_outcome();

        // Text fallback tier
        if outcome.is_none() {
            check_cancel(cancel)?;
            let started = Instant::now();
            let scope = FallbackScope {
                series_hint: hints.series.as_deref(),
                season_hint: hints.season.as_deref(),
                top_series: settings.matching.fallback_top_series,
                top_episodes: settings.matching.fallback_top_episodes,
            };
            let candidates = self
                .text_matcher
                .find_candidates(&query.texts, &rows, &scores, &scope, cancel)
                .await?;
            check_cancel(cancel)?;
            let decision = evaluate_tier(candidates, thresholds.match_confidence, epsilon);
            record(&mut timings, MatchTier::TextFallbackMatch, &decision, started.elapsed());
            outcome = decision.into_outcome();
        }

        // Embedding tier
        if outcome.is_none() {
            check_cancel(cancel)?;
            let started = Instant::now();
            match self
                .embedding_matcher
                .query_vector(&query.texts.clean, hints.embedding.as_deref())
                .await
            {
                Ok(vector) => {
                    let scope = self.embedding_scope(&rows, &scores, hints, &settings.matching);
                    let candidates = self
                        .embedding_matcher
                        .find_candidates(&vector, &scope, EMBEDDING_SEARCH_LIMIT, cancel)
                        .await?;
                    check_cancel(cancel)?;
                    let decision = evaluate_tier(candidates, thresholds.embed_similarity, epsilon);
                    record(&mut timings, MatchTier::EmbeddingMatch, &decision, started.elapsed());
                    outcome = decision.into_outcome();
                }
                Err(err) => {
                    match &err {
                        EmbeddingError::ModelUnavailable(_) => {
                            debug!(reason = %err, "Embedding tier skipped")
                        }
                        _ => warn!(error = %err, "Embedding tier skipped"),
                    }
                    timings.push(TierTiming {
                        tier: MatchTier::EmbeddingMatch,
                        status: TierStatus::Skipped {
                            reason: err.to_string(),
                        },
                        elapsed: Duration::ZERO,
                        best_confidence: None,
                    });
                }
            }
        }

        let outcome = outcome.unwrap_or(MatchOutcome::NoMatch);
        let rename_eligible = match &outcome {
            MatchOutcome::Matched { candidate } => {
                candidate.confidence >= thresholds.rename_confidence
            }
            _ => false,
        };
        let total_elapsed = timings.iter().map(|t| t.elapsed).sum();

        let result = MatchResult {
            outcome,
            source_format,
            rename_eligible,
            tier_timings: timings,
            total_elapsed,
        };

        match &result.outcome {
            MatchOutcome::Matched { candidate } => info!(
                label = %candidate.label,
                entry_id = %candidate.entry_id,
                tier = candidate.tier.as_str(),
                confidence = candidate.confidence,
                rename_eligible,
                elapsed_ms = result.total_elapsed.as_millis(),
                "Match found"
            ),
            MatchOutcome::Ambiguous { candidates } => info!(
                candidates = candidates.len(),
                tier = ?result.tier(),
                elapsed_ms = result.total_elapsed.as_millis(),
                "Ambiguous match"
            ),
            MatchOutcome::NoMatch => info!(
                source_format = %source_format,
                elapsed_ms = result.total_elapsed.as_millis(),
                "No match"
            ),
        }

        Ok(result)
    }

    /// Hash similarity of every stored row against the query, on the blocking pool
    async fn score_rows(
        &self,
        rows: &Arc<Vec<HashRow>>,
        query: &PreparedQuery,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, ItemError> {
        let rows = Arc::clone(rows);
        let digests = query.digests.clone();
        let cancel_scan = cancel.clone();

        let scores = tokio::task::spawn_blocking(move || {
            rows.par_iter()
                .map(|row| {
                    if cancel_scan.is_cancelled() {
                        0
                    } else {
                        row.similarity(&digests)
                    }
                })
                .collect::<Vec<u8>>()
        })
        .await
        .map_err(|e| ItemError::Store(Error::Internal(format!("Hash scan task failed: {}", e))))?;

        check_cancel(cancel)?;
        Ok(scores)
    }

    /// Same series narrowing as the text tier when a hint exists, else everything
    fn embedding_scope(
        &self,
        rows: &[HashRow],
        scores: &[u8],
        hints: &IdentifyHints,
        matching: &epmatch_common::config::MatchingConfig,
    ) -> EmbeddingScope {
        let Some(hint) = hints.series.as_deref().filter(|h| !h.trim().is_empty()) else {
            return EmbeddingScope::default();
        };
        let scope = FallbackScope {
            series_hint: Some(hint),
            season_hint: hints.season.as_deref(),
            top_series: matching.fallback_top_series,
            top_episodes: matching.fallback_top_episodes,
        };
        let season = hints
            .season
            .as_deref()
            .and_then(|s| crate::models::entry::normalize_number(s, 'S').ok());

        EmbeddingScope {
            series: select_series(rows, scores, &scope),
            season,
        }
    }
}

fn check_cancel(cancel: &CancellationToken) -> Result<(), ItemError> {
    if cancel.is_cancelled() {
        Err(ItemError::Cancelled)
    } else {
        Ok(())
    }
}

fn record(timings: &mut Vec<TierTiming>, tier: MatchTier, decision: &TierDecision, elapsed: Duration) {
    debug!(
        tier = tier.as_str(),
        status = ?decision.status(),
        best_confidence = ?decision.best_confidence(),
        elapsed_ms = elapsed.as_millis(),
        "Tier finished"
    );
    timings.push(TierTiming {
        tier,
        status: decision.status(),
        elapsed,
        best_confidence: decision.best_confidence(),
    });
}

/// Build hash-tier candidates only for rows that can matter
fn hash_tier_decision(
    rows: &[HashRow],
    scores: &[u8],
    thresholds: &SubtitleTypeThresholds,
    epsilon: f32,
) -> TierDecision {
    let to_candidate = |row: &HashRow, score: u8| MatchCandidate {
        entry_id: row.id,
        label: row.label.clone(),
        source_format: row.source_format,
        confidence: f32::from(score) / 100.0,
        tier: MatchTier::HashMatch,
        scores: TierScores {
            hash_similarity: Some(score),
            ..TierScores::default()
        },
    };

    let mut candidates: Vec<MatchCandidate> = rows
        .iter()
        .zip(scores)
        .filter(|(_, score)| **score >= thresholds.fuzzy_hash_similarity)
        .map(|(row, &score)| to_candidate(row, score))
        .collect();

    if candidates.is_empty() {
        // Keep the best row so the timing records how close the tier came
        if let Some((row, &score)) = rows.iter().zip(scores).max_by_key(|pair| *pair.1) {
            candidates.push(to_candidate(row, score));
        }
    }

    evaluate_tier(candidates, thresholds.hash_confidence(), epsilon)
}
