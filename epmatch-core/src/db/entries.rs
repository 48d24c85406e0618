//! Subtitle entry persistence
//!
//! Row mapping and queries for `subtitle_entries`. Writes take a connection
//! (normally the store's monitored transaction); reads take the pool.

use crate::models::{CompositeHashKey, EpisodeLabel, LabelledEntry, TextVariants};
use chrono::{DateTime, Utc};
use epmatch_common::{Error, Result, SourceFormat};
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqliteConnection, SqlitePool};
use uuid::Uuid;

const ENTRY_COLUMNS: &str = "guid, series, season, episode, episode_name, \
     original_text, no_timecodes_text, no_html_text, clean_text, \
     original_hash, no_timecodes_hash, no_html_hash, clean_hash, \
     embedding, source_format, created_at";

/// Compact row used by the hash tier (no text columns)
#[derive(Debug, Clone)]
pub struct HashRowRecord {
    pub id: Uuid,
    pub label: EpisodeLabel,
    pub source_format: SourceFormat,
    /// Length of the clean text in characters
    pub clean_len: usize,
    pub hashes: CompositeHashKey,
}

/// Entry id, label and embedding vector
#[derive(Debug, Clone)]
pub struct EmbeddingRecord {
    pub id: Uuid,
    pub label: EpisodeLabel,
    pub source_format: SourceFormat,
    pub embedding: Vec<f32>,
}

/// Aggregate store statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreStatistics {
    pub total_entries: i64,
    pub distinct_series: i64,
    pub distinct_episodes: i64,
    pub entries_with_embeddings: i64,
    /// Entries beyond the first for their episode
    pub variant_entries: i64,
}

/// Series name with its entry count
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SeriesSummary {
    pub series: String,
    pub entries: i64,
    pub seasons: i64,
}

/// Encode an embedding as little-endian f32 bytes
pub fn encode_embedding(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// Decode little-endian f32 bytes
pub fn decode_embedding(bytes: &[u8]) -> Result<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return Err(Error::Internal(format!(
            "embedding blob length {} is not a multiple of 4",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

fn parse_guid(row: &SqliteRow) -> Result<Uuid> {
    let guid: String = row.try_get("guid")?;
    Uuid::parse_str(&guid).map_err(|e| Error::Internal(format!("invalid guid '{}': {}", guid, e)))
}

fn parse_format(row: &SqliteRow) -> Result<SourceFormat> {
    let raw: String = row.try_get("source_format")?;
    raw.parse()
}

fn label_from_row(row: &SqliteRow) -> Result<EpisodeLabel> {
    // Stored labels were normalized on insert; take them verbatim
    Ok(EpisodeLabel {
        series: row.try_get("series")?,
        season: row.try_get("season")?,
        episode: row.try_get("episode")?,
        episode_name: row.try_get("episode_name")?,
    })
}

fn hashes_from_row(row: &SqliteRow) -> Result<CompositeHashKey> {
    Ok(CompositeHashKey {
        original: row.try_get("original_hash")?,
        no_timecodes: row.try_get("no_timecodes_hash")?,
        no_html: row.try_get("no_html_hash")?,
        clean: row.try_get("clean_hash")?,
    })
}

fn entry_from_row(row: &SqliteRow) -> Result<LabelledEntry> {
    let created_raw: String = row.try_get("created_at")?;
    let created_at = DateTime::parse_from_rfc3339(&created_raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| Error::Internal(format!("invalid created_at '{}': {}", created_raw, e)))?;

    let embedding: Option<Vec<u8>> = row.try_get("embedding")?;

    Ok(LabelledEntry {
        id: parse_guid(row)?,
        label: label_from_row(row)?,
        texts: TextVariants {
            original: row.try_get("original_text")?,
            no_timecodes: row.try_get("no_timecodes_text")?,
            no_html: row.try_get("no_html_text")?,
            clean: row.try_get("clean_text")?,
        },
        hashes: hashes_from_row(row)?,
        embedding: embedding.as_deref().map(decode_embedding).transpose()?,
        source_format: parse_format(row)?,
        created_at,
    })
}

/// Insert an entry unless its composite hash key already exists
///
/// Returns false when the UNIQUE constraint swallowed the row.
pub async fn insert_entry(conn: &mut SqliteConnection, entry: &LabelledEntry) -> Result<bool> {
    let embedding = entry.embedding.as_deref().map(encode_embedding);
    let embedding_dim = entry.embedding.as_ref().map(|v| v.len() as i64);

    let rows = sqlx::query(
        r#"
        INSERT INTO subtitle_entries (
            guid, series, season, episode, episode_name,
            original_text, no_timecodes_text, no_html_text, clean_text,
            original_hash, no_timecodes_hash, no_html_hash, clean_hash,
            embedding, embedding_dim, source_format, created_at
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT (original_hash, no_timecodes_hash, no_html_hash, clean_hash) DO NOTHING
        "#,
    )
    .bind(entry.id.to_string())
    .bind(&entry.label.series)
    .bind(&entry.label.season)
    .bind(&entry.label.episode)
    .bind(&entry.label.episode_name)
    .bind(&entry.texts.original)
    .bind(&entry.texts.no_timecodes)
    .bind(&entry.texts.no_html)
    .bind(&entry.texts.clean)
    .bind(&entry.hashes.original)
    .bind(&entry.hashes.no_timecodes)
    .bind(&entry.hashes.no_html)
    .bind(&entry.hashes.clean)
    .bind(embedding)
    .bind(embedding_dim)
    .bind(entry.source_format.as_str())
    .bind(entry.created_at.to_rfc3339())
    .execute(&mut *conn)
    .await?
    .rows_affected();

    Ok(rows > 0)
}

/// Id of the entry with exactly this composite key
pub async fn find_id_by_key(
    conn: &mut SqliteConnection,
    key: &CompositeHashKey,
) -> Result<Option<Uuid>> {
    let guid: Option<String> = sqlx::query_scalar(
        r#"
        SELECT guid FROM subtitle_entries
        WHERE original_hash = ? AND no_timecodes_hash = ? AND no_html_hash = ? AND clean_hash = ?
        "#,
    )
    .bind(&key.original)
    .bind(&key.no_timecodes)
    .bind(&key.no_html)
    .bind(&key.clean)
    .fetch_optional(&mut *conn)
    .await?;

    guid.map(|g| {
        Uuid::parse_str(&g).map_err(|e| Error::Internal(format!("invalid guid '{}': {}", g, e)))
    })
    .transpose()
}

/// Number of entries stored for an episode
pub async fn count_for_label(conn: &mut SqliteConnection, label: &EpisodeLabel) -> Result<i64> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM subtitle_entries WHERE series = ? AND season = ? AND episode = ?",
    )
    .bind(&label.series)
    .bind(&label.season)
    .bind(&label.episode)
    .fetch_one(&mut *conn)
    .await?;

    Ok(count)
}

pub async fn load_by_key(pool: &SqlitePool, key: &CompositeHashKey) -> Result<Option<LabelledEntry>> {
    let sql = format!(
        "SELECT {} FROM subtitle_entries \
         WHERE original_hash = ? AND no_timecodes_hash = ? AND no_html_hash = ? AND clean_hash = ?",
        ENTRY_COLUMNS
    );
    let row = sqlx::query(&sql)
        .bind(&key.original)
        .bind(&key.no_timecodes)
        .bind(&key.no_html)
        .bind(&key.clean)
        .fetch_optional(pool)
        .await?;

    row.as_ref().map(entry_from_row).transpose()
}

pub async fn load_by_id(pool: &SqlitePool, id: Uuid) -> Result<Option<LabelledEntry>> {
    let sql = format!("SELECT {} FROM subtitle_entries WHERE guid = ?", ENTRY_COLUMNS);
    let row = sqlx::query(&sql)
        .bind(id.to_string())
        .fetch_optional(pool)
        .await?;

    row.as_ref().map(entry_from_row).transpose()
}

/// Load several entries; missing ids are ignored
pub async fn load_by_ids(pool: &SqlitePool, ids: &[Uuid]) -> Result<Vec<LabelledEntry>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }

    let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
        "SELECT {} FROM subtitle_entries WHERE guid IN (",
        ENTRY_COLUMNS
    ));
    let mut separated = builder.separated(", ");
    for id in ids {
        separated.push_bind(id.to_string());
    }
    separated.push_unseparated(") ORDER BY series, season, episode, guid");

    let rows = builder.build().fetch_all(pool).await?;
    rows.iter().map(entry_from_row).collect()
}

/// Entries of a series, optionally restricted to one season
pub async fn load_by_series(
    pool: &SqlitePool,
    series: &str,
    season: Option<&str>,
) -> Result<Vec<LabelledEntry>> {
    let rows = match season {
        Some(season) => {
            let sql = format!(
                "SELECT {} FROM subtitle_entries WHERE series = ? AND season = ? \
                 ORDER BY season, episode, guid",
                ENTRY_COLUMNS
            );
            sqlx::query(&sql)
                .bind(series)
                .bind(season)
                .fetch_all(pool)
                .await?
        }
        None => {
            let sql = format!(
                "SELECT {} FROM subtitle_entries WHERE series = ? ORDER BY season, episode, guid",
                ENTRY_COLUMNS
            );
            sqlx::query(&sql).bind(series).fetch_all(pool).await?
        }
    };

    rows.iter().map(entry_from_row).collect()
}

/// Compact hash rows for every entry
pub async fn load_hash_rows(pool: &SqlitePool) -> Result<Vec<HashRowRecord>> {
    let rows = sqlx::query(
        r#"
        SELECT guid, series, season, episode, episode_name, source_format,
               length(clean_text) AS clean_len,
               original_hash, no_timecodes_hash, no_html_hash, clean_hash
        FROM subtitle_entries
        ORDER BY series, season, episode, guid
        "#,
    )
    .fetch_all(pool)
    .await?;

    rows.iter()
        .map(|row| {
            let clean_len: i64 = row.try_get("clean_len")?;
            Ok(HashRowRecord {
                id: parse_guid(row)?,
                label: label_from_row(row)?,
                source_format: parse_format(row)?,
                clean_len: clean_len.max(0) as usize,
                hashes: hashes_from_row(row)?,
            })
        })
        .collect()
}

/// Entries that carry an embedding, optionally scoped to a series / season
pub async fn load_embeddings(
    pool: &SqlitePool,
    series: Option<&str>,
    season: Option<&str>,
) -> Result<Vec<EmbeddingRecord>> {
    let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
        "SELECT guid, series, season, episode, episode_name, source_format, embedding \
         FROM subtitle_entries WHERE embedding IS NOT NULL",
    );
    if let Some(series) = series {
        builder.push(" AND series = ").push_bind(series.to_string());
        if let Some(season) = season {
            builder.push(" AND season = ").push_bind(season.to_string());
        }
    }
    builder.push(" ORDER BY series, season, episode, guid");

    let rows = builder.build().fetch_all(pool).await?;
    rows.iter()
        .map(|row| {
            let blob: Vec<u8> = row.try_get("embedding")?;
            Ok(EmbeddingRecord {
                id: parse_guid(row)?,
                label: label_from_row(row)?,
                source_format: parse_format(row)?,
                embedding: decode_embedding(&blob)?,
            })
        })
        .collect()
}

pub async fn count_entries(pool: &SqlitePool) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM subtitle_entries")
        .fetch_one(pool)
        .await?;
    Ok(count)
}

pub async fn load_statistics(pool: &SqlitePool) -> Result<StoreStatistics> {
    let row = sqlx::query(
        r#"
        SELECT
            COUNT(*) AS total_entries,
            COUNT(DISTINCT series) AS distinct_series,
            COUNT(DISTINCT series || char(31) || season || char(31) || episode) AS distinct_episodes,
            COUNT(embedding) AS entries_with_embeddings
        FROM subtitle_entries
        "#,
    )
    .fetch_one(pool)
    .await?;

    let total_entries: i64 = row.try_get("total_entries")?;
    let distinct_episodes: i64 = row.try_get("distinct_episodes")?;

    Ok(StoreStatistics {
        total_entries,
        distinct_series: row.try_get("distinct_series")?,
        distinct_episodes,
        entries_with_embeddings: row.try_get("entries_with_embeddings")?,
        variant_entries: total_entries - distinct_episodes,
    })
}

pub async fn list_series(pool: &SqlitePool) -> Result<Vec<SeriesSummary>> {
    let rows = sqlx::query(
        r#"
        SELECT series, COUNT(*) AS entries, COUNT(DISTINCT season) AS seasons
        FROM subtitle_entries
        GROUP BY series
        ORDER BY series
        "#,
    )
    .fetch_all(pool)
    .await?;

    rows.iter()
        .map(|row| {
            Ok(SeriesSummary {
                series: row.try_get("series")?,
                entries: row.try_get("entries")?,
                seasons: row.try_get("seasons")?,
            })
        })
        .collect()
}
