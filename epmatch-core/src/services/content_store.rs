//! Content store and duplicate detector
//!
//! Content-addressed store of labelled subtitle entries keyed by the
//! composite hash tuple. Identical content is rejected, new content for an
//! already-known episode is accepted as a variant.
//!
//! Writes are serialized through a single in-process writer gate and are
//! additionally guarded by the table's UNIQUE constraint, so two writers
//! racing on identical content (even from different processes) can never
//! both succeed. Reads run in parallel on the pool.

use crate::db::entries::{self, EmbeddingRecord, SeriesSummary, StoreStatistics};
use crate::models::{
    CompositeHashKey, EntryCandidate, EpisodeLabel, LabelledEntry, StoreOutcome,
};
use crate::services::fuzzy_hash::{self, FuzzyDigest};
use crate::services::text_normalizer;
use crate::utils::{begin_monitored, retry_on_lock};
use chrono::Utc;
use epmatch_common::db::{get_setting_i64, SETTING_MAX_LOCK_WAIT_MS};
use epmatch_common::events::{EpmatchEvent, EventBus};
use epmatch_common::{Error, Result, SourceFormat};
use sqlx::SqlitePool;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

const DEFAULT_MAX_LOCK_WAIT_MS: i64 = 5000;

/// Hash-tier view of one entry with pre-parsed digests
#[derive(Debug, Clone)]
pub struct HashRow {
    pub id: Uuid,
    pub label: EpisodeLabel,
    pub source_format: SourceFormat,
    pub clean_len: usize,
    /// Digests in composite-key order; `None` if a stored digest is malformed
    pub digests: [Option<FuzzyDigest>; 4],
}

impl HashRow {
    /// Best same-variant similarity against a query's digests
    pub fn similarity(&self, query: &[Option<FuzzyDigest>; 4]) -> u8 {
        self.digests
            .iter()
            .zip(query.iter())
            .filter_map(|(stored, q)| match (stored, q) {
                (Some(s), Some(q)) => Some(s.similarity(q)),
                _ => None,
            })
            .max()
            .unwrap_or(0)
    }
}

/// Parse the four digests of a composite key
pub fn parse_digests(key: &CompositeHashKey) -> [Option<FuzzyDigest>; 4] {
    key.as_array().map(FuzzyDigest::parse)
}

/// Normalize and hash a candidate into a ready-to-store entry
///
/// Runs on the blocking pool: hashing tens of kilobytes four times is CPU work.
pub async fn prepare_entry(candidate: EntryCandidate) -> Result<LabelledEntry> {
    if let Some(embedding) = &candidate.embedding {
        if embedding.is_empty() || embedding.iter().any(|v| !v.is_finite()) {
            return Err(Error::InvalidInput(format!(
                "{}: embedding must be a non-empty vector of finite values",
                candidate.label
            )));
        }
    }

    let entry = tokio::task::spawn_blocking(move || {
        let texts = text_normalizer::normalize(&candidate.text);
        let hashes = CompositeHashKey {
            original: fuzzy_hash::hash(&texts.original),
            no_timecodes: fuzzy_hash::hash(&texts.no_timecodes),
            no_html: fuzzy_hash::hash(&texts.no_html),
            clean: fuzzy_hash::hash(&texts.clean),
        };
        LabelledEntry {
            id: Uuid::new_v4(),
            label: candidate.label,
            texts,
            hashes,
            embedding: candidate.embedding,
            source_format: candidate.source_format,
            created_at: Utc::now(),
        }
    })
    .await
    .map_err(|e| Error::Internal(format!("Hashing task failed: {}", e)))?;

    if entry.texts.is_empty() {
        return Err(Error::InvalidInput(format!(
            "{}: subtitle text is empty after normalization",
            entry.label
        )));
    }

    Ok(entry)
}

/// SQLite-backed content store
pub struct ContentStore {
    db: SqlitePool,
    write_gate: Mutex<()>,
    hash_rows: RwLock<Option<Arc<Vec<HashRow>>>>,
    /// Bumped on every insert; a cache fill only lands if it did not move
    generation: AtomicU64,
    event_bus: Option<EventBus>,
}

impl ContentStore {
    pub fn new(db: SqlitePool) -> Self {
        Self {
            db,
            write_gate: Mutex::new(()),
            hash_rows: RwLock::new(None),
            generation: AtomicU64::new(0),
            event_bus: None,
        }
    }

    /// Publish `DuplicateContentRejected` events on this bus
    pub fn with_event_bus(mut self, event_bus: EventBus) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.db
    }

    /// Normalize, hash and store a candidate
    pub async fn store(&self, candidate: EntryCandidate) -> Result<StoreOutcome> {
        let entry = prepare_entry(candidate).await?;
        self.store_entry(&entry).await
    }

    /// Store a prepared entry
    pub async fn store_entry(&self, entry: &LabelledEntry) -> Result<StoreOutcome> {
        let max_wait_ms =
            get_setting_i64(&self.db, SETTING_MAX_LOCK_WAIT_MS, DEFAULT_MAX_LOCK_WAIT_MS)
                .await?
                .max(0) as u64;

        let outcome = {
            let _writer = self.write_gate.lock().await;
            retry_on_lock("content_store::store", max_wait_ms, || self.try_insert(entry)).await?
        };

        match outcome {
            StoreOutcome::RejectedDuplicate { existing_entry_id } => {
                info!(
                    existing_entry_id = %existing_entry_id,
                    label = %entry.label,
                    source_format = %entry.source_format,
                    "Duplicate content rejected"
                );
                if let Some(bus) = &self.event_bus {
                    bus.emit_lossy(EpmatchEvent::DuplicateContentRejected {
                        existing_entry_id,
                        series: entry.label.series.clone(),
                        season: entry.label.season.clone(),
                        episode: entry.label.episode.clone(),
                        timestamp: Utc::now(),
                    });
                }
            }
            StoreOutcome::InsertedAsVariant {
                entry_id,
                existing_variants,
            } => {
                self.invalidate_cache();
                info!(
                    entry_id = %entry_id,
                    label = %entry.label,
                    existing_variants,
                    "Stored new variant"
                );
            }
            StoreOutcome::Inserted { entry_id } => {
                self.invalidate_cache();
                debug!(entry_id = %entry_id, label = %entry.label, "Stored new entry");
            }
        }

        Ok(outcome)
    }

    /// Check-then-insert inside one transaction
    async fn try_insert(&self, entry: &LabelledEntry) -> Result<StoreOutcome> {
        let mut tx = begin_monitored(&self.db, "content_store::store").await?;

        if let Some(existing_entry_id) =
            entries::find_id_by_key(&mut **tx.inner_mut()?, &entry.hashes).await?
        {
            tx.rollback().await?;
            return Ok(StoreOutcome::RejectedDuplicate { existing_entry_id });
        }

        let existing_variants = entries::count_for_label(&mut **tx.inner_mut()?, &entry.label).await?;

        if !entries::insert_entry(&mut **tx.inner_mut()?, entry).await? {
            // Another connection committed the same key after our lookup
            let existing_entry_id = entries::find_id_by_key(&mut **tx.inner_mut()?, &entry.hashes)
                .await?
                .ok_or_else(|| {
                    Error::Internal("Insert conflicted but no existing entry found".to_string())
                })?;
            tx.rollback().await?;
            return Ok(StoreOutcome::RejectedDuplicate { existing_entry_id });
        }

        tx.commit().await?;

        Ok(if existing_variants > 0 {
            StoreOutcome::InsertedAsVariant {
                entry_id: entry.id,
                existing_variants: existing_variants as u64,
            }
        } else {
            StoreOutcome::Inserted { entry_id: entry.id }
        })
    }

    /// Exact lookup by composite key
    pub async fn get(&self, key: &CompositeHashKey) -> Result<Option<LabelledEntry>> {
        entries::load_by_key(&self.db, key).await
    }

    pub async fn get_by_id(&self, id: Uuid) -> Result<Option<LabelledEntry>> {
        entries::load_by_id(&self.db, id).await
    }

    pub async fn get_many(&self, ids: &[Uuid]) -> Result<Vec<LabelledEntry>> {
        entries::load_by_ids(&self.db, ids).await
    }

    /// Entries of a series, optionally one season ("1", "01" and "S01" are equivalent)
    pub async fn query_by_series(
        &self,
        series: &str,
        season: Option<&str>,
    ) -> Result<Vec<LabelledEntry>> {
        let season = season
            .map(|s| crate::models::entry::normalize_number(s, 'S'))
            .transpose()?;
        entries::load_by_series(&self.db, series.trim(), season.as_deref()).await
    }

    /// Entries with embeddings, optionally scoped
    pub async fn embeddings(
        &self,
        series: Option<&str>,
        season: Option<&str>,
    ) -> Result<Vec<EmbeddingRecord>> {
        entries::load_embeddings(&self.db, series, season).await
    }

    /// Cached hash rows for the whole corpus
    pub async fn hash_rows(&self) -> Result<Arc<Vec<HashRow>>> {
        if let Some(rows) = self.read_cache() {
            return Ok(rows);
        }

        let generation = self.generation.load(Ordering::SeqCst);
        let records = entries::load_hash_rows(&self.db).await?;

        let rows: Arc<Vec<HashRow>> = Arc::new(
            records
                .into_iter()
                .map(|r| HashRow {
                    digests: parse_digests(&r.hashes),
                    id: r.id,
                    label: r.label,
                    source_format: r.source_format,
                    clean_len: r.clean_len,
                })
                .collect(),
        );

        let mut cache = self.hash_rows.write().unwrap_or_else(|e| e.into_inner());
        if self.generation.load(Ordering::SeqCst) == generation {
            *cache = Some(Arc::clone(&rows));
        }
        debug!(rows = rows.len(), "Loaded hash rows");

        Ok(rows)
    }

    fn read_cache(&self) -> Option<Arc<Vec<HashRow>>> {
        self.hash_rows
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(Arc::clone)
    }

    fn invalidate_cache(&self) {
        let mut cache = self.hash_rows.write().unwrap_or_else(|e| e.into_inner());
        self.generation.fetch_add(1, Ordering::SeqCst);
        *cache = None;
    }

    pub async fn count(&self) -> Result<i64> {
        entries::count_entries(&self.db).await
    }

    pub async fn statistics(&self) -> Result<StoreStatistics> {
        entries::load_statistics(&self.db).await
    }

    pub async fn list_series(&self) -> Result<Vec<SeriesSummary>> {
        entries::list_series(&self.db).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use epmatch_common::db::init_memory_database;

    fn candidate(episode: &str, text: &str) -> EntryCandidate {
        EntryCandidate::new(
            EpisodeLabel::new("Show", "01", episode, None).unwrap(),
            text,
            SourceFormat::TextBased,
        )
    }

    #[tokio::test]
    async fn test_prepare_entry_hashes_all_variants() {
        let entry = prepare_entry(candidate("01", "<b>Hello</b> world")).await.unwrap();
        assert_eq!(entry.texts.clean, "hello world");
        assert_eq!(entry.hashes.clean, fuzzy_hash::hash("hello world"));
        assert_ne!(entry.hashes.original, entry.hashes.clean);
    }

    #[tokio::test]
    async fn test_empty_text_rejected() {
        let err = prepare_entry(candidate("01", " \n ")).await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_bad_embedding_rejected() {
        let err = prepare_entry(candidate("01", "text").with_embedding(vec![f32::NAN]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_hash_row_cache_invalidated_on_insert() {
        let store = ContentStore::new(init_memory_database().await.unwrap());

        store.store(candidate("01", "first episode text")).await.unwrap();
        let rows = store.hash_rows().await.unwrap();
        assert_eq!(rows.len(), 1);

        // Cached snapshot is reused
        let again = store.hash_rows().await.unwrap();
        assert!(Arc::ptr_eq(&rows, &again));

        store.store(candidate("02", "second episode text")).await.unwrap();
        assert_eq!(store.hash_rows().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_emits_event() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        let store = ContentStore::new(init_memory_database().await.unwrap()).with_event_bus(bus);

        let first = store.store(candidate("03", "same words")).await.unwrap();
        let second = store.store(candidate("03", "same words")).await.unwrap();
        assert_eq!(
            second,
            StoreOutcome::RejectedDuplicate {
                existing_entry_id: first.entry_id()
            }
        );

        match rx.recv().await.unwrap() {
            EpmatchEvent::DuplicateContentRejected { episode, .. } => assert_eq!(episode, "03"),
            other => panic!("Unexpected event: {:?}", other),
        }
    }
}
