use crate::shortcode::ShortCode;
use thiserror::Error;

/// Result type for link-store operations.
pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Debug, Clone, Error)]
pub enum StorageError {
    /// The long URL is already stored. Carries the code it was stored under,
    /// so the caller still receives a usable short link.
    #[error("long url already shortened as {existing}")]
    DuplicateLink { existing: ShortCode },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("storage backend unavailable: {0}")]
    Unavailable(String),
    #[error("storage operation timed out: {0}")]
    Timeout(String),
    #[error("operation not supported by the {backend} backend: {operation}")]
    Unsupported {
        backend: &'static str,
        operation: &'static str,
    },
    #[error("storage query failed: {0}")]
    Query(String),
    #[error("stored data is invalid: {0}")]
    InvalidData(String),
    #[error("storage operation failed: {0}")]
    Operation(String),
}

impl StorageError {
    /// Returns the pre-existing short code if this is a duplicate-link error.
    pub fn existing_code(&self) -> Option<&ShortCode> {
        match self {
            StorageError::DuplicateLink { existing } => Some(existing),
            _ => None,
        }
    }

    /// Whether the error means the backend could not be reached in time.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StorageError::Unavailable(_) | StorageError::Timeout(_))
    }
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::Unavailable(err.to_string())
    }
}
