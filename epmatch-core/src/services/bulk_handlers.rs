//! Work handlers for bulk identify and bulk store
//!
//! Reading source files is delegated to small collaborator traits so the
//! extraction/OCR layer (or a test double) can supply text however it likes.

use crate::error::ItemError;
use crate::models::{BulkWorkItem, EntryCandidate, EpisodeLabel, ItemOutcome};
use crate::services::batch_processor::{ItemStep, WorkHandler};
use crate::services::content_store::{prepare_entry, ContentStore};
use crate::services::match_orchestrator::{IdentifyHints, MatchOrchestrator};
use epmatch_common::SourceFormat;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Text read from a source file
#[derive(Debug, Clone)]
pub struct SourceText {
    pub text: String,
    pub source_format: SourceFormat,
    pub hints: IdentifyHints,
}

/// Supplies normalized-ready text for a path
#[async_trait::async_trait]
pub trait TextSource: Send + Sync {
    async fn read_text(&self, path: &Path) -> Result<SourceText, ItemError>;
}

/// Supplies a labelled candidate for a path
#[async_trait::async_trait]
pub trait EntrySource: Send + Sync {
    async fn read_entry(&self, path: &Path) -> Result<EntryCandidate, ItemError>;
}

/// Reads UTF-8 subtitle files from disk
///
/// The source format comes from the file extension unless overridden.
#[derive(Debug, Clone, Default)]
pub struct PlainTextSource {
    format_override: Option<SourceFormat>,
}

impl PlainTextSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_format(source_format: SourceFormat) -> Self {
        Self {
            format_override: Some(source_format),
        }
    }

    fn format_for(&self, path: &Path) -> Result<SourceFormat, ItemError> {
        if let Some(format) = self.format_override {
            return Ok(format);
        }
        SourceFormat::infer_from_extension(path).ok_or_else(|| {
            ItemError::Validation(format!("{}: unsupported subtitle file type", path.display()))
        })
    }
}

#[async_trait::async_trait]
impl TextSource for PlainTextSource {
    async fn read_text(&self, path: &Path) -> Result<SourceText, ItemError> {
        let source_format = self.format_for(path)?;
        let bytes = tokio::fs::read(path).await?;
        let text = String::from_utf8(bytes).map_err(|e| {
            ItemError::Validation(format!("{}: not valid UTF-8: {}", path.display(), e))
        })?;

        debug!(path = %path.display(), bytes = text.len(), source_format = %source_format, "Read subtitle text");

        Ok(SourceText {
            text,
            source_format,
            hints: IdentifyHints::default(),
        })
    }
}

/// Labels supplied up front, text read from disk
#[derive(Debug, Clone, Default)]
pub struct MappedEntrySource {
    labels: HashMap<PathBuf, EpisodeLabel>,
    text: PlainTextSource,
}

impl MappedEntrySource {
    pub fn new(labels: HashMap<PathBuf, EpisodeLabel>) -> Self {
        Self {
            labels,
            text: PlainTextSource::new(),
        }
    }
}

#[async_trait::async_trait]
impl EntrySource for MappedEntrySource {
    async fn read_entry(&self, path: &Path) -> Result<EntryCandidate, ItemError> {
        let label = self.labels.get(path).cloned().ok_or_else(|| {
            ItemError::Validation(format!("{}: no label supplied", path.display()))
        })?;
        let source = self.text.read_text(path).await?;
        Ok(EntryCandidate::new(label, source.text, source.source_format))
    }
}

/// Bulk identify: read text, run the orchestrator
pub struct IdentifyHandler {
    orchestrator: Arc<MatchOrchestrator>,
    source: Arc<dyn TextSource>,
}

impl IdentifyHandler {
    pub fn new(orchestrator: Arc<MatchOrchestrator>, source: Arc<dyn TextSource>) -> Self {
        Self {
            orchestrator,
            source,
        }
    }
}

#[async_trait::async_trait]
impl WorkHandler for IdentifyHandler {
    fn operation(&self) -> &'static str {
        "identify"
    }

    async fn handle(
        &self,
        item: &BulkWorkItem,
        cancel: &CancellationToken,
    ) -> Result<ItemStep, ItemError> {
        let source = self.source.read_text(&item.path).await?;
        let result = self
            .orchestrator
            .identify(&source.text, source.source_format, &source.hints, cancel)
            .await?;
        Ok(ItemOutcome::Identified { result }.into())
    }
}

/// Bulk store: read and hash in parallel, write in submission order
///
/// When a batch holds the same content twice, the lower-indexed file is the
/// one stored and the other is skipped as a duplicate.
pub struct StoreHandler {
    store: Arc<ContentStore>,
    source: Arc<dyn EntrySource>,
}

impl StoreHandler {
    pub fn new(store: Arc<ContentStore>, source: Arc<dyn EntrySource>) -> Self {
        Self { store, source }
    }
}

#[async_trait::async_trait]
impl WorkHandler for StoreHandler {
    fn operation(&self) -> &'static str {
        "store"
    }

    async fn handle(
        &self,
        item: &BulkWorkItem,
        cancel: &CancellationToken,
    ) -> Result<ItemStep, ItemError> {
        let candidate = self.source.read_entry(&item.path).await?;
        let entry = prepare_entry(candidate).await?;
        if cancel.is_cancelled() {
            return Err(ItemError::Cancelled);
        }

        let store = Arc::clone(&self.store);
        Ok(ItemStep::Commit(Box::pin(async move {
            let outcome = store.store_entry(&entry).await?;
            Ok(ItemOutcome::Stored { outcome })
        })))
    }
}
