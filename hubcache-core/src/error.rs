//! Error types for cache operations

use std::path::PathBuf;

/// Result type for cache operations
pub type Result<T> = std::result::Result<T, CacheError>;

/// Errors that can occur while reading or writing the cache
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Cache directory not found: {0}")]
    CacheNotFound(PathBuf),

    #[error("Scan cache expects a directory but found a file: {0}")]
    NotADirectory(PathBuf),

    #[error("Corrupted cache at {path}: {reason}")]
    CorruptedCache { path: PathBuf, reason: String },

    #[error("Invalid repo id '{id}': {reason}")]
    InvalidRepoId { id: String, reason: String },

    #[error("Invalid repo type '{0}': must be `model`, `dataset` or `space`")]
    InvalidRepoType(String),

    #[error("Invalid blob hash: {0}")]
    InvalidHash(String),

    #[error("Invalid path in repo '{0}'")]
    InvalidPath(String),

    #[error("Invalid hf:// url '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Revision not found in cache: {0}")]
    RevisionNotFound(String),

    #[error("Entry not found in cache: {0}")]
    EntryNotFound(String),

    #[error("Content does not match blob hash {expected} (got {actual})")]
    HashMismatch { expected: String, actual: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Commit failed: {0}")]
    Commit(String),

    #[error("Commit interval must be greater than zero, got {0:?}")]
    InvalidInterval(std::time::Duration),
}

impl CacheError {
    pub(crate) fn corrupted(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::CorruptedCache {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// True when the error means the requested thing simply isn't cached
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::CacheNotFound(_) | Self::RevisionNotFound(_) | Self::EntryNotFound(_)
        ) || matches!(self, Self::Io(e) if e.kind() == std::io::ErrorKind::NotFound)
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
