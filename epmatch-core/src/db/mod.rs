//! Database access for epmatch-core
//!
//! Pool creation and schema live in `epmatch_common::db`.

pub mod entries;

pub use entries::{EmbeddingRecord, HashRowRecord, SeriesSummary, StoreStatistics};
