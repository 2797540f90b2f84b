//! Error types for the core cache and reconciliation layer.

use thiserror::Error;

use crate::query::QueryKey;

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors raised while reading the cache or normalizing push payloads.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A cached value was read back as a different type than it was stored with
    #[error("Cached value for '{key}' is not a {expected}")]
    TypeMismatch { key: QueryKey, expected: &'static str },

    /// A socket payload could not be turned into a canonical entity patch
    #[error("Cannot normalize '{event}' payload: {message}")]
    Normalize { event: String, message: String },

    /// JSON conversion error while merging entities
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CoreError {
    /// Create a normalization error for an event.
    pub fn normalize(event: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Normalize {
            event: event.into(),
            message: message.into(),
        }
    }

    /// Create a type mismatch error for a key.
    pub fn type_mismatch<T>(key: &QueryKey) -> Self {
        Self::TypeMismatch {
            key: key.clone(),
            expected: std::any::type_name::<T>(),
        }
    }
}
