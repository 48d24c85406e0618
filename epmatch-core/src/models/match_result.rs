//! Match results
//!
//! "No match" and "ambiguous" are ordinary outcomes, not errors.

use super::entry::EpisodeLabel;
use epmatch_common::SourceFormat;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Matching tier, in escalation order
///
/// Earlier tiers are cheaper and calibrated to be more precise, so an
/// accepted result from an earlier tier always wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MatchTier {
    HashMatch,
    TextFallbackMatch,
    EmbeddingMatch,
}

impl MatchTier {
    pub const ORDER: [MatchTier; 3] = [
        MatchTier::HashMatch,
        MatchTier::TextFallbackMatch,
        MatchTier::EmbeddingMatch,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MatchTier::HashMatch => "hash",
            MatchTier::TextFallbackMatch => "text_fallback",
            MatchTier::EmbeddingMatch => "embedding",
        }
    }
}

/// Tier-specific sub-scores of a candidate
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TierScores {
    /// CTPH similarity, 0-100
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash_similarity: Option<u8>,
    /// Token-set similarity, 0-100
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text_similarity: Option<f32>,
    /// Cosine distance (1 - cosine similarity)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding_distance: Option<f32>,
}

/// A stored entry proposed as the identity of the query text
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchCandidate {
    pub entry_id: Uuid,
    pub label: EpisodeLabel,
    pub source_format: SourceFormat,
    /// Confidence in [0, 1]
    pub confidence: f32,
    pub tier: MatchTier,
    pub scores: TierScores,
}

/// Outcome of one identify request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum MatchOutcome {
    Matched { candidate: MatchCandidate },
    /// Distinct episodes scored within the ambiguity epsilon; best first
    Ambiguous { candidates: Vec<MatchCandidate> },
    NoMatch,
}

/// What happened in one tier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TierStatus {
    Accepted,
    Ambiguous,
    BelowThreshold,
    NoCandidates,
    Skipped { reason: String },
}

/// Timing and status of an attempted (or skipped) tier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierTiming {
    pub tier: MatchTier,
    pub status: TierStatus,
    pub elapsed: Duration,
    /// Best confidence seen in the tier, accepted or not
    pub best_confidence: Option<f32>,
}

/// Result of `MatchOrchestrator::identify`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    pub outcome: MatchOutcome,
    pub source_format: SourceFormat,
    /// Non-ambiguous match at or above the format's rename confidence
    pub rename_eligible: bool,
    pub tier_timings: Vec<TierTiming>,
    /// Sum of attempted tier timings
    pub total_elapsed: Duration,
}

impl MatchResult {
    pub fn no_match(source_format: SourceFormat) -> Self {
        Self {
            outcome: MatchOutcome::NoMatch,
            source_format,
            rename_eligible: false,
            tier_timings: Vec::new(),
            total_elapsed: Duration::ZERO,
        }
    }

    pub fn matched(&self) -> bool {
        matches!(self.outcome, MatchOutcome::Matched { .. })
    }

    pub fn ambiguous(&self) -> bool {
        matches!(self.outcome, MatchOutcome::Ambiguous { .. })
    }

    /// The matched candidate, or the best of an ambiguous set
    pub fn candidate(&self) -> Option<&MatchCandidate> {
        match &self.outcome {
            MatchOutcome::Matched { candidate } => Some(candidate),
            MatchOutcome::Ambiguous { candidates } => candidates.first(),
            MatchOutcome::NoMatch => None,
        }
    }

    pub fn tier(&self) -> Option<MatchTier> {
        self.candidate().map(|c| c.tier)
    }

    pub fn confidence(&self) -> Option<f32> {
        self.candidate().map(|c| c.confidence)
    }

    pub fn timing(&self, tier: MatchTier) -> Option<&TierTiming> {
        self.tier_timings.iter().find(|t| t.tier == tier)
    }
}
