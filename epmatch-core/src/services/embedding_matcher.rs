//! Embedding matcher
//!
//! Nearest-neighbour search over stored embedding vectors. Generating
//! embeddings is the job of an external [`EmbeddingProvider`]; when none is
//! loaded and the caller supplied no vector, the tier is skipped and matching
//! degrades to the hash and text tiers.
//!
//! Confidence is cosine similarity clamped to [0, 1]; distance is 1 - cosine.

use crate::db::EmbeddingRecord;
use crate::models::{EpisodeLabel, MatchCandidate, MatchTier, TierScores};
use crate::services::content_store::ContentStore;
use crate::services::text_fallback_matcher::sort_candidates;
use epmatch_common::{Error, Result, SourceFormat};
use rayon::prelude::*;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

/// Embedding subsystem failures
#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
    /// No model loaded; the tier is skipped
    #[error("Embedding model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("Embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Invalid embedding: {0}")]
    InvalidVector(String),

    #[error("Embedding generation failed: {0}")]
    Failed(String),
}

/// External embedding model runtime
#[async_trait::async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Model name for logging
    fn name(&self) -> &str;

    /// Fixed output dimension
    fn dimension(&self) -> usize;

    /// False while the model is not loaded
    fn is_available(&self) -> bool;

    /// Embed a normalized text
    async fn embed(&self, text: &str) -> std::result::Result<Vec<f32>, EmbeddingError>;
}

/// Cosine similarity; `None` for mismatched lengths or zero vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Option<f32> {
    if a.len() != b.len() || a.is_empty() {
        return None;
    }
    let (mut dot, mut norm_a, mut norm_b) = (0.0f64, 0.0f64, 0.0f64);
    for (&x, &y) in a.iter().zip(b) {
        dot += f64::from(x) * f64::from(y);
        norm_a += f64::from(x) * f64::from(x);
        norm_b += f64::from(y) * f64::from(y);
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return None;
    }
    Some((dot / (norm_a.sqrt() * norm_b.sqrt())) as f32)
}

pub fn confidence_from_cosine(cosine: f32) -> f32 {
    cosine.clamp(0.0, 1.0)
}

fn validate_vector(vector: &[f32]) -> std::result::Result<(), EmbeddingError> {
    if vector.is_empty() {
        return Err(EmbeddingError::InvalidVector("empty vector".to_string()));
    }
    if vector.iter().any(|v| !v.is_finite()) {
        return Err(EmbeddingError::InvalidVector("non-finite component".to_string()));
    }
    if vector.iter().all(|v| *v == 0.0) {
        return Err(EmbeddingError::InvalidVector("zero vector".to_string()));
    }
    Ok(())
}

struct IndexedVector {
    id: Uuid,
    label: EpisodeLabel,
    source_format: SourceFormat,
    /// Unit-length copy of the stored vector
    unit: Vec<f32>,
}

/// Flat in-memory vector index
///
/// Vectors are normalized once on build so a search is one dot product per
/// entry. Entries whose dimension differs from the index dimension are left out.
pub struct VectorIndex {
    dimension: usize,
    vectors: Vec<IndexedVector>,
}

impl VectorIndex {
    pub fn build(dimension: usize, records: Vec<EmbeddingRecord>) -> Self {
        let total = records.len();
        let vectors: Vec<IndexedVector> = records
            .into_iter()
            .filter(|r| r.embedding.len() == dimension)
            .filter_map(|r| {
                let unit = unit_vector(&r.embedding)?;
                Some(IndexedVector {
                    id: r.id,
                    label: r.label,
                    source_format: r.source_format,
                    unit,
                })
            })
            .collect();

        if vectors.len() < total {
            debug!(
                indexed = vectors.len(),
                skipped = total - vectors.len(),
                dimension,
                "Skipped embeddings with a different dimension or zero norm"
            );
        }

        Self { dimension, vectors }
    }

    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }

    /// Top `limit` entries by cosine similarity, best first
    pub fn search(&self, query: &[f32], limit: usize) -> Vec<MatchCandidate> {
        let Some(query) = unit_vector(query).filter(|q| q.len() == self.dimension) else {
            return Vec::new();
        };

        let scored: Vec<MatchCandidate> = self
            .vectors
            .par_iter()
            .map(|v| {
                let cosine: f32 = v.unit.iter().zip(&query).map(|(a, b)| a * b).sum();
                MatchCandidate {
                    entry_id: v.id,
                    label: v.label.clone(),
                    source_format: v.source_format,
                    confidence: confidence_from_cosine(cosine),
                    tier: MatchTier::EmbeddingMatch,
                    scores: TierScores {
                        embedding_distance: Some(1.0 - cosine.clamp(-1.0, 1.0)),
                        ..TierScores::default()
                    },
                }
            })
            .collect();

        let mut sorted = sort_candidates(scored);
        sorted.truncate(limit);
        sorted
    }
}

fn unit_vector(v: &[f32]) -> Option<Vec<f32>> {
    let norm = v.iter().map(|x| f64::from(*x) * f64::from(*x)).sum::<f64>().sqrt();
    if norm == 0.0 || !norm.is_finite() {
        return None;
    }
    Some(v.iter().map(|x| (f64::from(*x) / norm) as f32).collect())
}

/// Where to search
#[derive(Debug, Clone, Default)]
pub struct EmbeddingScope {
    /// Empty means an unrestricted scan
    pub series: Vec<String>,
    pub season: Option<String>,
}

/// Embedding tier
pub struct EmbeddingMatcher {
    store: Arc<ContentStore>,
    provider: Option<Arc<dyn EmbeddingProvider>>,
}

impl EmbeddingMatcher {
    pub fn new(store: Arc<ContentStore>, provider: Option<Arc<dyn EmbeddingProvider>>) -> Self {
        Self { store, provider }
    }

    /// A vector can be produced without a caller-supplied one
    pub fn provider_available(&self) -> bool {
        self.provider.as_ref().is_some_and(|p| p.is_available())
    }

    /// The query vector: caller-supplied, or generated by the provider
    pub async fn query_vector(
        &self,
        clean_text: &str,
        precomputed: Option<&[f32]>,
    ) -> std::result::Result<Vec<f32>, EmbeddingError> {
        if let Some(vector) = precomputed {
            validate_vector(vector)?;
            if let Some(provider) = &self.provider {
                if vector.len() != provider.dimension() {
                    return Err(EmbeddingError::DimensionMismatch {
                        expected: provider.dimension(),
                        actual: vector.len(),
                    });
                }
            }
            return Ok(vector.to_vec());
        }

        let provider = match &self.provider {
            Some(p) if p.is_available() => p,
            Some(p) => {
                return Err(EmbeddingError::ModelUnavailable(format!(
                    "{} is not loaded",
                    p.name()
                )))
            }
            None => {
                return Err(EmbeddingError::ModelUnavailable(
                    "no embedding provider configured".to_string(),
                ))
            }
        };

        let vector = provider.embed(clean_text).await?;
        validate_vector(&vector)?;
        if vector.len() != provider.dimension() {
            return Err(EmbeddingError::DimensionMismatch {
                expected: provider.dimension(),
                actual: vector.len(),
            });
        }
        Ok(vector)
    }

    /// Nearest stored entries to `vector`, best first
    pub async fn find_candidates(
        &self,
        vector: &[f32],
        scope: &EmbeddingScope,
        limit: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<MatchCandidate>> {
        let mut records = Vec::new();
        if scope.series.is_empty() {
            records = self.store.embeddings(None, None).await?;
        } else {
            for series in &scope.series {
                if cancel.is_cancelled() {
                    return Ok(Vec::new());
                }
                records.extend(
                    self.store
                        .embeddings(Some(series), scope.season.as_deref())
                        .await?,
                );
            }
        }

        if records.is_empty() || cancel.is_cancelled() {
            return Ok(Vec::new());
        }

        let query = vector.to_vec();
        let candidates = tokio::task::spawn_blocking(move || {
            VectorIndex::build(query.len(), records).search(&query, limit)
        })
        .await
        .map_err(|e| Error::Internal(format!("Vector search task failed: {}", e)))?;

        Ok(candidates)
    }
}
