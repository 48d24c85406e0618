//! epmatch-core library interface
//!
//! Tiered episode matching (fuzzy hash, text fallback, embeddings) over a
//! content-addressed subtitle store, and the concurrent batch processor that
//! drives it over large file sets.

pub mod db;
pub mod error;
pub mod models;
pub mod services;
pub mod utils;

pub use crate::error::{ItemError, ItemErrorKind};
pub use crate::models::{
    BatchOptions, BatchResult, EntryCandidate, EpisodeLabel, LabelledEntry, MatchOutcome,
    MatchResult, MatchTier, StoreOutcome,
};
pub use crate::services::{ContentStore, MatchOrchestrator};
