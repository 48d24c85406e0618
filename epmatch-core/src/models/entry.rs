//! Labelled subtitle entries
//!
//! An entry is created once on store and never mutated afterwards.

use chrono::{DateTime, Utc};
use epmatch_common::{Error, Result, SourceFormat};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Series / season / episode label
///
/// Season and episode are zero-padded decimal strings ("01", "12", "105").
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EpisodeLabel {
    pub series: String,
    pub season: String,
    pub episode: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub episode_name: Option<String>,
}

impl EpisodeLabel {
    /// Build a validated label
    ///
    /// Accepts "1", "01" or "S01" for the season and "5", "05" or "E05" for
    /// the episode.
    pub fn new(
        series: &str,
        season: &str,
        episode: &str,
        episode_name: Option<&str>,
    ) -> Result<Self> {
        let series = series.trim();
        if series.is_empty() {
            return Err(Error::InvalidInput("series must not be empty".to_string()));
        }

        Ok(Self {
            series: series.to_string(),
            season: normalize_number(season, 'S')?,
            episode: normalize_number(episode, 'E')?,
            episode_name: episode_name
                .map(str::trim)
                .filter(|n| !n.is_empty())
                .map(str::to_string),
        })
    }

    /// (series, season, episode) without the optional name
    pub fn key(&self) -> (&str, &str, &str) {
        (&self.series, &self.season, &self.episode)
    }

    /// True when both labels name the same episode
    pub fn same_episode(&self, other: &EpisodeLabel) -> bool {
        self.key() == other.key()
    }
}

impl fmt::Display for EpisodeLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} S{}E{}", self.series, self.season, self.episode)
    }
}

/// Normalize a season/episode number to a zero-padded string of width 2
pub fn normalize_number(raw: &str, prefix: char) -> Result<String> {
    let trimmed = raw.trim();
    let digits = trimmed
        .strip_prefix(prefix)
        .or_else(|| trimmed.strip_prefix(prefix.to_ascii_lowercase()))
        .unwrap_or(trimmed);

    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(Error::InvalidInput(format!(
            "'{}' is not a valid {} number",
            raw,
            if prefix == 'S' { "season" } else { "episode" }
        )));
    }

    let value: u32 = digits
        .parse()
        .map_err(|_| Error::InvalidInput(format!("'{}' is out of range", raw)))?;

    Ok(format!("{:02}", value))
}

/// The four canonical renditions of a subtitle text
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextVariants {
    /// Text as supplied
    pub original: String,
    /// Cue numbers and timecode lines removed
    pub no_timecodes: String,
    /// HTML and ASS override tags removed
    pub no_html: String,
    /// Timecodes and markup removed, lower-cased, punctuation-free, single-spaced
    pub clean: String,
}

impl TextVariants {
    /// Variants in composite-key order
    pub fn as_array(&self) -> [&str; 4] {
        [&self.original, &self.no_timecodes, &self.no_html, &self.clean]
    }

    /// True when nothing comparable survives normalization
    pub fn is_empty(&self) -> bool {
        self.clean.is_empty()
    }
}

/// Uniqueness key: one CTPH digest per text variant
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CompositeHashKey {
    pub original: String,
    pub no_timecodes: String,
    pub no_html: String,
    pub clean: String,
}

impl CompositeHashKey {
    pub fn as_array(&self) -> [&str; 4] {
        [&self.original, &self.no_timecodes, &self.no_html, &self.clean]
    }
}

/// A persisted, labelled subtitle text
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelledEntry {
    pub id: Uuid,
    pub label: EpisodeLabel,
    pub texts: TextVariants,
    pub hashes: CompositeHashKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    pub source_format: SourceFormat,
    pub created_at: DateTime<Utc>,
}

/// Input to `ContentStore::store`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryCandidate {
    pub label: EpisodeLabel,
    pub text: String,
    pub source_format: SourceFormat,
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
}

impl EntryCandidate {
    pub fn new(label: EpisodeLabel, text: impl Into<String>, source_format: SourceFormat) -> Self {
        Self {
            label,
            text: text.into(),
            source_format,
            embedding: None,
        }
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }
}

/// Result of `ContentStore::store`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum StoreOutcome {
    /// First entry for its episode
    Inserted { entry_id: Uuid },
    /// New content for an episode that already had entries
    InsertedAsVariant {
        entry_id: Uuid,
        existing_variants: u64,
    },
    /// Identical composite hash key already stored; nothing written
    RejectedDuplicate { existing_entry_id: Uuid },
}

impl StoreOutcome {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, StoreOutcome::RejectedDuplicate { .. })
    }

    /// The stored entry, or the one that made this a duplicate
    pub fn entry_id(&self) -> Uuid {
        match self {
            StoreOutcome::Inserted { entry_id } => *entry_id,
            StoreOutcome::InsertedAsVariant { entry_id, .. } => *entry_id,
            StoreOutcome::RejectedDuplicate { existing_entry_id } => *existing_entry_id,
        }
    }
}
