//! Configuration loading and the settings provider
//!
//! Configuration is read from a TOML file, overridden by a small set of
//! environment variables, validated, and handed to the engine as an immutable
//! [`MatchSettings`] snapshot. The engine pulls a snapshot per operation through
//! [`SettingsProvider`]; watching the file for changes is the host's job.

use crate::{Error, Result, SourceFormat};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

/// Environment variable naming an explicit config file
pub const CONFIG_ENV_VAR: &str = "EPMATCH_CONFIG";
/// Environment variable overriding the root folder
pub const ROOT_ENV_VAR: &str = "EPMATCH_ROOT";
/// Environment variable overriding `batch.max_concurrency`
pub const MAX_CONCURRENCY_ENV_VAR: &str = "EPMATCH_MAX_CONCURRENCY";

/// Hard bounds for the worker pool size
pub const MIN_CONCURRENCY: usize = 1;
pub const MAX_CONCURRENCY: usize = 100;

/// Logging section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Per-format matching thresholds
///
/// Confidences are in [0, 1]; `fuzzy_hash_similarity` is a CTPH score in (0, 100].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SubtitleTypeThresholds {
    /// Minimum confidence for the text-fallback tier to accept a match
    pub match_confidence: f32,
    /// Minimum confidence before a host may rename files on the strength of a match
    pub rename_confidence: f32,
    /// Minimum CTPH similarity for the hash tier to accept a match
    pub fuzzy_hash_similarity: u8,
    /// Minimum cosine similarity for the embedding tier to accept a match
    pub embed_similarity: f32,
}

impl SubtitleTypeThresholds {
    /// Defaults for a source format
    ///
    /// OCR formats tolerate lower similarity than text subtitles.
    pub fn default_for(format: SourceFormat) -> Self {
        match format {
            SourceFormat::TextBased => Self {
                match_confidence: 0.80,
                rename_confidence: 0.90,
                fuzzy_hash_similarity: 70,
                embed_similarity: 0.85,
            },
            SourceFormat::Pgs => Self {
                match_confidence: 0.70,
                rename_confidence: 0.85,
                fuzzy_hash_similarity: 60,
                embed_similarity: 0.80,
            },
            SourceFormat::VobSub => Self {
                match_confidence: 0.65,
                rename_confidence: 0.80,
                fuzzy_hash_similarity: 55,
                embed_similarity: 0.78,
            },
        }
    }

    /// Hash-tier threshold expressed as a confidence
    pub fn hash_confidence(&self) -> f32 {
        f32::from(self.fuzzy_hash_similarity) / 100.0
    }

    /// Validate ranges and ordering
    pub fn validate(&self, format: SourceFormat) -> Result<()> {
        let in_unit = |v: f32| (0.0..=1.0).contains(&v);
        if !in_unit(self.match_confidence) {
            return Err(Error::Config(format!(
                "{}: match_confidence out of range: {}",
                format, self.match_confidence
            )));
        }
        if !in_unit(self.rename_confidence) {
            return Err(Error::Config(format!(
                "{}: rename_confidence out of range: {}",
                format, self.rename_confidence
            )));
        }
        if self.rename_confidence < self.match_confidence {
            return Err(Error::Config(format!(
                "{}: rename_confidence ({}) must be >= match_confidence ({})",
                format, self.rename_confidence, self.match_confidence
            )));
        }
        if self.fuzzy_hash_similarity == 0 || self.fuzzy_hash_similarity > 100 {
            return Err(Error::Config(format!(
                "{}: fuzzy_hash_similarity must be in 1..=100, got {}",
                format, self.fuzzy_hash_similarity
            )));
        }
        if !in_unit(self.embed_similarity) {
            return Err(Error::Config(format!(
                "{}: embed_similarity out of range: {}",
                format, self.embed_similarity
            )));
        }
        Ok(())
    }
}

fn default_text_based() -> SubtitleTypeThresholds {
    SubtitleTypeThresholds::default_for(SourceFormat::TextBased)
}

fn default_pgs() -> SubtitleTypeThresholds {
    SubtitleTypeThresholds::default_for(SourceFormat::Pgs)
}

fn default_vobsub() -> SubtitleTypeThresholds {
    SubtitleTypeThresholds::default_for(SourceFormat::VobSub)
}

/// Matching section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchingConfig {
    #[serde(default = "default_text_based")]
    pub text_based: SubtitleTypeThresholds,
    #[serde(default = "default_pgs")]
    pub pgs: SubtitleTypeThresholds,
    #[serde(default = "default_vobsub")]
    pub vobsub: SubtitleTypeThresholds,
    /// Two distinct episodes closer than this in confidence are ambiguous
    pub ambiguity_epsilon: f32,
    /// Series considered by the text-fallback tier (K)
    pub fallback_top_series: usize,
    /// Episodes per series considered by the text-fallback tier (N)
    pub fallback_top_episodes: usize,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            text_based: default_text_based(),
            pgs: default_pgs(),
            vobsub: default_vobsub(),
            ambiguity_epsilon: 0.02,
            fallback_top_series: 3,
            fallback_top_episodes: 5,
        }
    }
}

impl MatchingConfig {
    /// Thresholds for a source format
    pub fn thresholds(&self, format: SourceFormat) -> &SubtitleTypeThresholds {
        match format {
            SourceFormat::TextBased => &self.text_based,
            SourceFormat::Pgs => &self.pgs,
            SourceFormat::VobSub => &self.vobsub,
        }
    }

    pub fn validate(&self) -> Result<()> {
        for format in SourceFormat::ALL {
            self.thresholds(format).validate(format)?;
        }
        if !(0.0..=1.0).contains(&self.ambiguity_epsilon) {
            return Err(Error::Config(format!(
                "ambiguity_epsilon out of range: {}",
                self.ambiguity_epsilon
            )));
        }
        if self.fallback_top_series == 0 || self.fallback_top_episodes == 0 {
            return Err(Error::Config(
                "fallback_top_series and fallback_top_episodes must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Batch section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub max_concurrency: usize,
    pub continue_on_error: bool,
    pub max_errors_before_abort: usize,
    pub retry_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub item_timeout_ms: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            continue_on_error: true,
            max_errors_before_abort: 50,
            retry_attempts: 3,
            retry_base_delay_ms: 200,
            item_timeout_ms: 120_000,
        }
    }
}

/// On-disk configuration file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TomlConfig {
    /// Folder holding the database
    pub root_folder: Option<PathBuf>,
    pub logging: LoggingConfig,
    pub matching: MatchingConfig,
    pub batch: BatchConfig,
}

/// Immutable settings snapshot consumed by the engine
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MatchSettings {
    pub matching: MatchingConfig,
    pub batch: BatchConfig,
}

impl MatchSettings {
    /// Build a validated snapshot from a parsed config file
    pub fn from_config(config: &TomlConfig) -> Result<Self> {
        let settings = Self {
            matching: config.matching.clone(),
            batch: config.batch.clone(),
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        self.matching.validate()?;
        if self.batch.item_timeout_ms == 0 {
            return Err(Error::Config("item_timeout_ms must be positive".to_string()));
        }
        Ok(())
    }

    /// Thresholds for a source format
    pub fn thresholds(&self, format: SourceFormat) -> &SubtitleTypeThresholds {
        self.matching.thresholds(format)
    }
}

/// Source of settings snapshots
///
/// Implementations must return a complete, validated snapshot; callers read
/// one snapshot per operation and never observe a half-applied update.
pub trait SettingsProvider: Send + Sync {
    fn snapshot(&self) -> Arc<MatchSettings>;
}

/// Settings that never change
#[derive(Debug, Clone, Default)]
pub struct FixedSettings {
    settings: Arc<MatchSettings>,
}

impl FixedSettings {
    pub fn new(settings: MatchSettings) -> Self {
        Self {
            settings: Arc::new(settings),
        }
    }
}

impl SettingsProvider for FixedSettings {
    fn snapshot(&self) -> Arc<MatchSettings> {
        Arc::clone(&self.settings)
    }
}

/// Settings that a host-side watcher may swap atomically
#[derive(Debug, Default)]
pub struct SharedSettings {
    current: RwLock<Arc<MatchSettings>>,
}

impl SharedSettings {
    pub fn new(settings: MatchSettings) -> Self {
        Self {
            current: RwLock::new(Arc::new(settings)),
        }
    }

    /// Replace the current snapshot
    ///
    /// The new snapshot is validated first; on error the old one stays live.
    pub fn replace(&self, settings: MatchSettings) -> Result<()> {
        settings.validate()?;
        let mut guard = self
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = Arc::new(settings);
        info!("Settings snapshot replaced");
        Ok(())
    }
}

impl SettingsProvider for SharedSettings {
    fn snapshot(&self) -> Arc<MatchSettings> {
        let guard = self
            .current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(&guard)
    }
}

/// Locate the config file
///
/// Priority: explicit path → `EPMATCH_CONFIG` → `<config_dir>/epmatch/config.toml`
/// (only if it exists).
pub fn resolve_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }

    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        if !path.trim().is_empty() {
            return Some(PathBuf::from(path));
        }
    }

    dirs::config_dir()
        .map(|d| d.join("epmatch").join("config.toml"))
        .filter(|p| p.exists())
}

/// Load a TOML config file
///
/// A missing file is not an error: defaults are used and a warning logged.
/// A file that exists but does not parse is a configuration error.
pub fn load_toml_config(path: &Path) -> Result<TomlConfig> {
    if !path.exists() {
        warn!(path = %path.display(), "Config file not found, using defaults");
        return Ok(TomlConfig::default());
    }

    let content = std::fs::read_to_string(path)?;
    let config: TomlConfig = toml::from_str(&content)
        .map_err(|e| Error::Config(format!("Parse TOML failed ({}): {}", path.display(), e)))?;

    info!(path = %path.display(), "Loaded configuration");
    Ok(config)
}

/// Apply environment overrides in place
pub fn apply_env_overrides(config: &mut TomlConfig) -> Result<()> {
    if let Ok(value) = std::env::var(ROOT_ENV_VAR) {
        if !value.trim().is_empty() {
            config.root_folder = Some(PathBuf::from(value));
        }
    }

    if let Ok(value) = std::env::var(MAX_CONCURRENCY_ENV_VAR) {
        let parsed: usize = value.trim().parse().map_err(|_| {
            Error::Config(format!(
                "{} must be a positive integer, got '{}'",
                MAX_CONCURRENCY_ENV_VAR, value
            ))
        })?;
        config.batch.max_concurrency = parsed;
    }

    Ok(())
}

/// Resolve, load and override configuration in one step
pub fn load_config(explicit: Option<&Path>) -> Result<TomlConfig> {
    let mut config = match resolve_config_path(explicit) {
        Some(path) => load_toml_config(&path)?,
        None => {
            info!("No config file found, using defaults");
            TomlConfig::default()
        }
    };
    apply_env_overrides(&mut config)?;
    Ok(config)
}

/// Root folder holding the database
///
/// Priority: configured `root_folder` (already env-overridden) → OS default.
pub fn resolve_root_folder(config: &TomlConfig) -> PathBuf {
    config
        .root_folder
        .clone()
        .unwrap_or_else(default_root_folder)
}

/// Database path under a root folder
pub fn database_path(root_folder: &Path) -> PathBuf {
    root_folder.join("epmatch.db")
}

fn default_root_folder() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("epmatch"))
        .unwrap_or_else(|| PathBuf::from("./epmatch_data"))
}
