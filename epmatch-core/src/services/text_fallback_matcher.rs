//! Text fallback matcher
//!
//! Scoped token-set comparison used when the hash tier finds nothing good
//! enough. The search is deliberately narrow: a few series (the caller's
//! hint, or the best series by hash score), then a few episodes per series
//! chosen by a cheap pre-filter. Full texts are loaded only for those.

use crate::models::{MatchCandidate, MatchTier, TextVariants, TierScores};
use crate::services::content_store::{ContentStore, HashRow};
use crate::services::text_normalizer;
use epmatch_common::{Error, Result};
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

/// Residual strings longer than this skip the edit-distance refinement
pub const MAX_DIFF_CHARS: usize = 1024;

/// Lower-cased alphanumeric tokens
pub fn tokenize(text: &str) -> BTreeSet<String> {
    text_normalizer::clean(text)
        .split_whitespace()
        .map(str::to_string)
        .collect()
}

/// Order-independent token overlap, 0-100
pub fn token_set_similarity(a: &str, b: &str) -> f32 {
    token_set_ratio(&tokenize(a), &tokenize(b))
}

/// Token-set ratio over pre-tokenized inputs
///
/// With I the sorted intersection and Dx the sorted remainders, compares
/// I to I+Da, I to I+Db and I+Da to I+Db and keeps the best. The first two
/// have a closed form because I is a prefix; the third adds an edit-distance
/// match of the remainders when they are short enough.
pub fn token_set_ratio(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f32 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }

    let sect = join(a.intersection(b));
    let rest_a = join(a.difference(b));
    let rest_b = join(b.difference(a));

    let sect_len = sect.chars().count();
    let rest_a_len = rest_a.chars().count();
    let rest_b_len = rest_b.chars().count();

    let combined_a = joined_len(sect_len, rest_a_len);
    let combined_b = joined_len(sect_len, rest_b_len);

    let mut best = 0.0f64;
    if sect_len > 0 {
        best = best
            .max(prefix_ratio(sect_len, combined_a))
            .max(prefix_ratio(sect_len, combined_b));
    }

    // The combined strings share the intersection plus its separator
    let shared = if sect_len > 0 && rest_a_len > 0 && rest_b_len > 0 {
        sect_len + 1
    } else {
        sect_len
    };
    let rest_matched = if rest_a_len <= MAX_DIFF_CHARS && rest_b_len <= MAX_DIFF_CHARS {
        let distance = strsim::levenshtein(&rest_a, &rest_b);
        rest_a_len.max(rest_b_len).saturating_sub(distance)
    } else {
        0
    };
    let total = combined_a + combined_b;
    if total > 0 {
        best = best.max(2.0 * (shared + rest_matched) as f64 / total as f64);
    }

    (best.min(1.0) * 100.0) as f32
}

fn join<'a>(tokens: impl Iterator<Item = &'a String>) -> String {
    tokens.map(String::as_str).collect::<Vec<_>>().join(" ")
}

fn joined_len(sect_len: usize, rest_len: usize) -> usize {
    match (sect_len, rest_len) {
        (0, r) => r,
        (s, 0) => s,
        (s, r) => s + 1 + r,
    }
}

fn prefix_ratio(prefix_len: usize, full_len: usize) -> f64 {
    2.0 * prefix_len as f64 / (prefix_len + full_len) as f64
}

/// Best similarity of the query tokens against any of the stored variants
pub fn best_variant_similarity(query: &BTreeSet<String>, texts: &TextVariants) -> f32 {
    texts
        .as_array()
        .iter()
        .map(|variant| token_set_ratio(query, &tokenize(variant)))
        .fold(0.0, f32::max)
}

/// Narrowing parameters for one fallback search
#[derive(Debug, Clone, Default)]
pub struct FallbackScope<'a> {
    pub series_hint: Option<&'a str>,
    pub season_hint: Option<&'a str>,
    /// K: series considered when no usable hint exists
    pub top_series: usize,
    /// N: episodes considered per series
    pub top_episodes: usize,
}

/// Scoped token-set matcher
pub struct TextFallbackMatcher {
    store: Arc<ContentStore>,
}

impl TextFallbackMatcher {
    pub fn new(store: Arc<ContentStore>) -> Self {
        Self { store }
    }

    /// Candidates from the narrowed set, best first
    ///
    /// `rows` and `hash_scores` are the hash tier's corpus view and its
    /// per-row scores (same order). Threshold filtering is left to the caller.
    pub async fn find_candidates(
        &self,
        query: &TextVariants,
        rows: &[HashRow],
        hash_scores: &[u8],
        scope: &FallbackScope<'_>,
        cancel: &CancellationToken,
    ) -> Result<Vec<MatchCandidate>> {
        if query.is_empty() || rows.is_empty() {
            return Ok(Vec::new());
        }

        let series = select_series(rows, hash_scores, scope);
        let ids = select_entries(rows, hash_scores, &series, query.clean.chars().count(), scope);

        debug!(
            series = ?series,
            entries = ids.len(),
            "Text fallback scope selected"
        );

        if ids.is_empty() || cancel.is_cancelled() {
            return Ok(Vec::new());
        }

        let entries = self.store.get_many(&ids).await?;
        let query_tokens = tokenize(&query.clean);
        let cancel = cancel.clone();

        let candidates = tokio::task::spawn_blocking(move || {
            let mut candidates = Vec::with_capacity(entries.len());
            for entry in entries {
                if cancel.is_cancelled() {
                    break;
                }
                let similarity = best_variant_similarity(&query_tokens, &entry.texts);
                candidates.push(MatchCandidate {
                    entry_id: entry.id,
                    label: entry.label,
                    source_format: entry.source_format,
                    confidence: similarity / 100.0,
                    tier: MatchTier::TextFallbackMatch,
                    scores: TierScores {
                        text_similarity: Some(similarity),
                        ..TierScores::default()
                    },
                });
            }
            candidates
        })
        .await
        .map_err(|e| Error::Internal(format!("Text fallback task failed: {}", e)))?;

        Ok(sort_candidates(candidates))
    }
}

/// Sort best first; ties broken by label then id so results are stable
pub fn sort_candidates(mut candidates: Vec<MatchCandidate>) -> Vec<MatchCandidate> {
    candidates.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.label.cmp(&b.label))
            .then_with(|| a.entry_id.cmp(&b.entry_id))
    });
    candidates
}

/// Series to search: the hinted series if the corpus knows it, else top-K by hash score
pub(crate) fn select_series(rows: &[HashRow], hash_scores: &[u8], scope: &FallbackScope<'_>) -> Vec<String> {
    let mut best_by_series: HashMap<&str, u8> = HashMap::new();
    for (row, &score) in rows.iter().zip(hash_scores) {
        let best = best_by_series.entry(row.label.series.as_str()).or_insert(0);
        *best = (*best).max(score);
    }

    if let Some(hint) = scope.series_hint.map(str::trim).filter(|h| !h.is_empty()) {
        let hint_lower = hint.to_lowercase();
        let mut hinted: Vec<&str> = best_by_series
            .keys()
            .copied()
            .filter(|s| s.to_lowercase() == hint_lower)
            .collect();
        if hinted.is_empty() {
            // Loose match: filename-derived hints are often partial
            hinted = best_by_series
                .keys()
                .copied()
                .filter(|s| {
                    let s = s.to_lowercase();
                    s.contains(&hint_lower) || hint_lower.contains(&s)
                })
                .collect();
        }
        if !hinted.is_empty() {
            hinted.sort_unstable();
            return hinted.into_iter().map(str::to_string).collect();
        }
    }

    let mut ranked: Vec<(&str, u8)> = best_by_series.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
    ranked
        .into_iter()
        .take(scope.top_series.max(1))
        .map(|(s, _)| s.to_string())
        .collect()
}

/// Entries of the top-N episodes per selected series
///
/// Episodes rank by best hash score, then by how close their clean text
/// length is to the query's, then by (season, episode).
fn select_entries(
    rows: &[HashRow],
    hash_scores: &[u8],
    series: &[String],
    query_len: usize,
    scope: &FallbackScope<'_>,
) -> Vec<Uuid> {
    let season_hint = scope
        .season_hint
        .and_then(|s| crate::models::entry::normalize_number(s, 'S').ok());

    struct EpisodeRank<'r> {
        season: &'r str,
        episode: &'r str,
        best_score: u8,
        length_gap: usize,
        ids: Vec<Uuid>,
    }

    let mut selected = Vec::new();
    for name in series {
        let mut episodes: HashMap<(&str, &str), EpisodeRank<'_>> = HashMap::new();

        for (row, &score) in rows.iter().zip(hash_scores) {
            if &row.label.series != name {
                continue;
            }
            if let Some(season) = &season_hint {
                if &row.label.season != season {
                    continue;
                }
            }
            let gap = row.clean_len.abs_diff(query_len);
            let rank = episodes
                .entry((row.label.season.as_str(), row.label.episode.as_str()))
                .or_insert_with(|| EpisodeRank {
                    season: &row.label.season,
                    episode: &row.label.episode,
                    best_score: 0,
                    length_gap: usize::MAX,
                    ids: Vec::new(),
                });
            rank.best_score = rank.best_score.max(score);
            rank.length_gap = rank.length_gap.min(gap);
            rank.ids.push(row.id);
        }

        let mut ranked: Vec<EpisodeRank<'_>> = episodes.into_values().collect();
        ranked.sort_by(|a, b| {
            b.best_score
                .cmp(&a.best_score)
                .then_with(|| a.length_gap.cmp(&b.length_gap))
                .then_with(|| (a.season, a.episode).cmp(&(b.season, b.episode)))
        });

        for rank in ranked.into_iter().take(scope.top_episodes.max(1)) {
            selected.extend(rank.ids);
        }
    }

    selected
}
