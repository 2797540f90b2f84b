//! Failures of the warehouse REST API, from dropped connections to
//! `{data: null}` bodies.

use thiserror::Error;

/// Result of one REST call.
pub type Result<T> = std::result::Result<T, ApiError>;

/// What a caller should do after a failed call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiRetryClass {
    /// Transient failures such as 5xx and throttling.
    Retryable,
    /// The request itself is wrong; retrying repeats the failure.
    Permanent,
    /// The access token was rejected or is missing.
    ReauthRequired,
}

/// A failed call to the warehouse API.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Transport failure before a status came back.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Body did not match the entity shape, or a draft failed to encode.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Non-2xx status. `message` is the server's `message` field or the raw body.
    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// 2xx with an empty body or `{data: null}`.
    #[error("Empty response from {endpoint}")]
    EmptyResponse { endpoint: String },

    /// Caught client-side, e.g. a write against an unsaved optimistic id.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Token header could not be built.
    #[error("Authentication error: {0}")]
    Auth(String),
}

impl ApiError {
    pub fn api(status: u16, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            message: message.into(),
        }
    }

    pub fn empty_response(endpoint: impl Into<String>) -> Self {
        Self::EmptyResponse {
            endpoint: endpoint.into(),
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::Auth(message.into())
    }

    /// HTTP status if this is an API error.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Api { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// 401/403 need a new token; 408, 409, 423, 425, 429 and 5xx are worth retrying.
    pub fn retry_class(&self) -> ApiRetryClass {
        match self {
            Self::Api { status, .. } => match *status {
                401 | 403 => ApiRetryClass::ReauthRequired,
                408 | 409 | 423 | 425 | 429 => ApiRetryClass::Retryable,
                500..=599 => ApiRetryClass::Retryable,
                _ => ApiRetryClass::Permanent,
            },
            Self::Http(_) => ApiRetryClass::Retryable,
            // an empty body usually means the backend failed upstream
            Self::EmptyResponse { .. } => ApiRetryClass::Retryable,
            Self::Json(_) => ApiRetryClass::Permanent,
            Self::InvalidRequest(_) => ApiRetryClass::Permanent,
            Self::Auth(_) => ApiRetryClass::ReauthRequired,
        }
    }

    /// True when the record no longer exists server-side.
    pub fn is_not_found(&self) -> bool {
        self.status_code() == Some(404)
    }
}
