//! Error types for queries, mutations and configuration.

use std::sync::Arc;
use thiserror::Error;

use stockyard_api::ApiError;
use stockyard_core::{CoreError, QueryKey};

/// Result type alias for cache reads.
pub type QueryResult<T> = std::result::Result<T, QueryError>;

/// Errors surfaced by [`QueryClient`](crate::QueryClient) reads.
///
/// Cloneable because one fetch result is shared by every waiter on a key.
#[derive(Debug, Clone, Error)]
pub enum QueryError {
    /// The network fetch for a key failed
    #[error("Fetch for '{key}' failed: {source}")]
    Fetch {
        key: QueryKey,
        #[source]
        source: Arc<ApiError>,
    },

    /// The key holds a value of another type
    #[error("Cached value for '{key}' is not a {expected}")]
    TypeMismatch { key: QueryKey, expected: &'static str },

    /// The fetch was cancelled and nothing is cached for the key
    #[error("Fetch for '{0}' was cancelled")]
    Cancelled(QueryKey),

    /// No list view with this name is declared for the resource
    #[error("Unknown view '{view}' for {resource}")]
    UnknownView {
        resource: &'static str,
        view: String,
    },

    #[error(transparent)]
    Core(Arc<CoreError>),
}

impl QueryError {
    pub fn fetch(key: &QueryKey, source: ApiError) -> Self {
        Self::Fetch {
            key: key.clone(),
            source: Arc::new(source),
        }
    }

    pub fn unknown_view(resource: &'static str, view: impl Into<String>) -> Self {
        Self::UnknownView {
            resource,
            view: view.into(),
        }
    }

    /// The API error behind a failed fetch, if any.
    pub fn api_error(&self) -> Option<&ApiError> {
        match self {
            Self::Fetch { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<CoreError> for QueryError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::TypeMismatch { key, expected } => Self::TypeMismatch { key, expected },
            other => Self::Core(Arc::new(other)),
        }
    }
}

/// Errors surfaced by optimistic mutations.
#[derive(Debug, Error)]
pub enum MutationError {
    /// The request failed before any optimistic change was applied
    #[error(transparent)]
    Api(#[from] ApiError),

    /// The request failed and the optimistic change was undone
    #[error("Mutation rolled back: {source}")]
    RolledBack { source: ApiError },

    #[error(transparent)]
    Core(#[from] CoreError),
}

impl MutationError {
    pub fn api_error(&self) -> Option<&ApiError> {
        match self {
            Self::Api(err) | Self::RolledBack { source: err } => Some(err),
            Self::Core(_) => None,
        }
    }

    pub fn is_rolled_back(&self) -> bool {
        matches!(self, Self::RolledBack { .. })
    }
}

/// Errors raised while reading [`SyncConfig`](crate::SyncConfig) from the environment.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{0} not configured")]
    Missing(&'static str),

    #[error("{name} has an invalid value '{value}'")]
    Invalid { name: &'static str, value: String },
}
