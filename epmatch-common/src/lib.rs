//! # epmatch Common Library
//!
//! Shared code for the epmatch matching engine and its host binaries:
//! - Error type and result alias
//! - Subtitle source formats and per-format thresholds
//! - Configuration loading (TOML + environment) and the settings provider
//! - Database pool initialization and schema
//! - Event types (EpmatchEvent) and the EventBus

pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod format;

pub use config::{MatchSettings, SettingsProvider, SubtitleTypeThresholds};
pub use error::{Error, Result};
pub use format::SourceFormat;
