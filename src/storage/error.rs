// src/storage/error.rs

use std::time::Duration;

/// Error types for blob store operations
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Storage backend unavailable: {0}")]
    Unavailable(String),

    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Object already exists: {0}")]
    KeyConflict(String),

    #[error("Invalid object key '{key}': {reason}")]
    InvalidKey { key: String, reason: &'static str },

    #[error("Storage request timed out after {0:?}")]
    Timeout(Duration),
}

impl StorageError {
    /// Transient failures that are safe to retry with backoff.
    /// `NotFound`, `KeyConflict` and `InvalidKey` are permanent for that key.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(StorageError::Unavailable("503".into()).is_retryable());
        assert!(StorageError::Timeout(Duration::from_secs(5)).is_retryable());
        assert!(!StorageError::NotFound("k".into()).is_retryable());
        assert!(!StorageError::KeyConflict("k".into()).is_retryable());
        assert!(
            !StorageError::InvalidKey {
                key: "/k".into(),
                reason: "leading slash"
            }
            .is_retryable()
        );
    }
}
