use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, EbakupError>;

#[derive(Debug, Error)]
pub enum EbakupError {
    #[error("checksum mismatch in block {index} of '{path}'")]
    BlockCorrupt { path: PathBuf, index: u64 },

    #[error("invalid format in '{path}': {reason}")]
    InvalidFormat { path: PathBuf, reason: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("another writer is active on '{0}'")]
    ConcurrentWriter(PathBuf),

    #[error("content id collision for checksum {0}")]
    CidCollision(String),

    #[error("content {0} is missing from the object store")]
    ContentMissing(String),

    #[error("could not acquire lock on '{0}'")]
    LockContention(PathBuf),

    #[error("'{0}' was replaced while we held it; retry")]
    StaleReplaced(PathBuf),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EbakupError {
    /// Shorthand for the most common construction site.
    pub fn invalid_format(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        EbakupError::InvalidFormat {
            path: path.into(),
            reason: reason.into(),
        }
    }
}
