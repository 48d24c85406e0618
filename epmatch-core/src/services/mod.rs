//! Matching engine and batch services

pub mod batch_processor;
pub mod bulk_handlers;
pub mod content_store;
pub mod embedding_matcher;
pub mod fuzzy_hash;
pub mod match_orchestrator;
pub mod progress_tracker;
pub mod text_fallback_matcher;
pub mod text_normalizer;

pub use batch_processor::{BatchProcessor, ItemStep, OrderedCommit, WorkHandler};
pub use bulk_handlers::{
    EntrySource, IdentifyHandler, MappedEntrySource, PlainTextSource, SourceText, StoreHandler,
    TextSource,
};
pub use content_store::{ContentStore, HashRow};
pub use embedding_matcher::{EmbeddingError, EmbeddingMatcher, EmbeddingProvider, VectorIndex};
pub use match_orchestrator::{IdentifyHints, MatchOrchestrator};
pub use progress_tracker::{ProgressSink, ProgressTracker};
pub use text_fallback_matcher::{token_set_similarity, TextFallbackMatcher};
