//! Data models for epmatch-core

pub mod bulk;
pub mod entry;
pub mod match_result;

pub use bulk::{
    BatchCounts, BatchOptions, BatchResult, BatchStatistics, BulkProgress, BulkWorkItem,
    ItemOutcome, ItemReport, WorkItemState,
};
pub use entry::{
    CompositeHashKey, EntryCandidate, EpisodeLabel, LabelledEntry, StoreOutcome, TextVariants,
};
pub use match_result::{
    MatchCandidate, MatchOutcome, MatchResult, MatchTier, TierScores, TierStatus, TierTiming,
};
