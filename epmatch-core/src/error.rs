//! Per-item error taxonomy
//!
//! Errors raised while processing a single work item. The batch processor
//! uses [`ItemError::is_retryable`] to decide whether an attempt may be
//! repeated; everything else fails the item immediately.

use serde::{Deserialize, Serialize};
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Failure of one work item
#[derive(Debug, Error)]
pub enum ItemError {
    /// Bad input (unreadable source, invalid label, unsupported format)
    #[error("Validation failed: {0}")]
    Validation(String),

    /// The attempt exceeded the per-item timeout
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// Transient I/O failure worth another attempt
    #[error("Transient I/O error: {0}")]
    TransientIo(String),

    /// Store failure (database, schema, internal)
    #[error("Store error: {0}")]
    Store(epmatch_common::Error),

    /// Every allowed attempt failed with a retryable error
    #[error("Retries exhausted after {attempts} attempts: {last_error}")]
    RetryExhausted {
        attempts: u32,
        last_error: Box<ItemError>,
    },

    /// Cancellation was requested before the item finished
    #[error("Cancelled")]
    Cancelled,
}

/// Serializable discriminant of [`ItemError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemErrorKind {
    Validation,
    Timeout,
    TransientIo,
    Store,
    RetryExhausted,
    Cancelled,
}

impl ItemError {
    /// True when another attempt may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            ItemError::Timeout(_) | ItemError::TransientIo(_) => true,
            ItemError::Store(err) => err.is_database_locked(),
            ItemError::Validation(_) | ItemError::RetryExhausted { .. } | ItemError::Cancelled => {
                false
            }
        }
    }

    pub fn kind(&self) -> ItemErrorKind {
        match self {
            ItemError::Validation(_) => ItemErrorKind::Validation,
            ItemError::Timeout(_) => ItemErrorKind::Timeout,
            ItemError::TransientIo(_) => ItemErrorKind::TransientIo,
            ItemError::Store(_) => ItemErrorKind::Store,
            ItemError::RetryExhausted { .. } => ItemErrorKind::RetryExhausted,
            ItemError::Cancelled => ItemErrorKind::Cancelled,
        }
    }
}

/// Classify an I/O error by kind
///
/// Missing, malformed or forbidden sources will not fix themselves, so they
/// are validation failures. Interruptions and timeouts are transient.
impl From<io::Error> for ItemError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::Interrupted
            | io::ErrorKind::TimedOut
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof => ItemError::TransientIo(err.to_string()),
            _ => ItemError::Validation(err.to_string()),
        }
    }
}

impl From<epmatch_common::Error> for ItemError {
    fn from(err: epmatch_common::Error) -> Self {
        match err {
            epmatch_common::Error::InvalidInput(msg) => ItemError::Validation(msg),
            epmatch_common::Error::Io(io_err) => ItemError::from(io_err),
            other => ItemError::Store(other),
        }
    }
}
