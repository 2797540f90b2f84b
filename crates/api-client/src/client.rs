//! REST client for the warehouse API.
//!
//! Endpoints are resource-oriented (`GET /chamber-stock`, `PATCH /production/:id`)
//! and paginate with `limit`/`offset` query parameters.

use log::debug;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::time::Duration;

use crate::error::{ApiError, Result};
use stockyard_core::entities::{is_optimistic_id, Entity};

/// Default timeout for API requests.
const DEFAULT_TIMEOUT_SECS: u64 = 30;
const MAX_LOG_BODY_CHARS: usize = 512;

/// Keys a response envelope may carry next to `data`.
const ENVELOPE_KEYS: [&str; 5] = ["data", "message", "success", "status", "total"];

/// Query parameters for a list request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListQuery {
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    pub params: Vec<(String, String)>,
}

impl ListQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn page(mut self, offset: u64, limit: u64) -> Self {
        self.offset = Some(offset);
        self.limit = Some(limit);
        self
    }

    pub fn param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((name.into(), value.into()));
        self
    }

    fn to_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = self.params.clone();
        if let Some(limit) = self.limit {
            pairs.push(("limit".to_string(), limit.to_string()));
        }
        if let Some(offset) = self.offset {
            pairs.push(("offset".to_string(), offset.to_string()));
        }
        pairs
    }
}

/// Reject `null` and empty bodies instead of caching them as "no data".
///
/// Empty arrays pass: an empty list is a legitimate answer.
pub fn reject_empty_or_null(endpoint: &str, value: Value) -> Result<Value> {
    let empty = match &value {
        Value::Null => true,
        Value::String(text) => text.trim().is_empty(),
        Value::Object(fields) => fields.is_empty(),
        _ => false,
    };
    if empty {
        return Err(ApiError::empty_response(endpoint));
    }
    Ok(value)
}

/// Unwrap `{ "data": ..., "message": ... }` style envelopes.
fn unwrap_data_envelope(value: Value) -> Value {
    match value {
        Value::Object(mut fields)
            if fields.contains_key("data")
                && fields.keys().all(|key| ENVELOPE_KEYS.contains(&key.as_str())) =>
        {
            fields.remove("data").unwrap_or(Value::Null)
        }
        other => other,
    }
}

/// Client for the warehouse REST API.
#[derive(Debug, Clone)]
pub struct ApiClient {
    client: reqwest::Client,
    base_url: String,
    access_token: Option<String>,
}

impl ApiClient {
    fn log_response(status: reqwest::StatusCode, body: &str) {
        if status.is_success() {
            debug!("[Api] Response status: {}", status);
            return;
        }

        let mut preview = body.chars().take(MAX_LOG_BODY_CHARS).collect::<String>();
        if body.chars().count() > MAX_LOG_BODY_CHARS {
            preview.push_str("...");
        }
        debug!("[Api] Response error ({}): {}", status, preview);
    }

    /// Create a new API client.
    ///
    /// # Arguments
    ///
    /// * `base_url` - The base URL of the warehouse API (e.g., "https://api.example.com/api")
    pub fn new(base_url: &str) -> Self {
        Self::with_timeout(base_url, Duration::from_secs(DEFAULT_TIMEOUT_SECS))
    }

    pub fn with_timeout(base_url: &str, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("Failed to build HTTP client");

        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            access_token: None,
        }
    }

    /// Attach a bearer token sent with every request.
    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        if let Some(token) = &self.access_token {
            let auth_value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|_| ApiError::auth("Invalid access token format"))?;
            headers.insert(AUTHORIZATION, auth_value);
        }

        Ok(headers)
    }

    fn collection_url<E: Entity>(&self) -> String {
        format!("{}/{}", self.base_url, E::ENDPOINT)
    }

    fn item_url<E: Entity>(&self, id: &str) -> String {
        format!(
            "{}/{}/{}",
            self.base_url,
            E::ENDPOINT,
            urlencoding::encode(id)
        )
    }

    /// Parse a JSON response body, rejecting empty payloads.
    async fn parse_response<T: DeserializeOwned>(
        response: reqwest::Response,
        endpoint: &str,
    ) -> Result<T> {
        let status = response.status();
        let body = response.text().await?;
        Self::log_response(status, &body);

        if !status.is_success() {
            if let Ok(error) = serde_json::from_str::<Value>(&body) {
                if let Some(message) = error.get("message").and_then(Value::as_str) {
                    return Err(ApiError::api(status.as_u16(), message));
                }
            }
            return Err(ApiError::api(
                status.as_u16(),
                format!("Request failed: {}", body),
            ));
        }

        if body.trim().is_empty() {
            return Err(ApiError::empty_response(endpoint));
        }
        let value: Value = serde_json::from_str(&body)?;
        let value = reject_empty_or_null(endpoint, unwrap_data_envelope(value))?;

        serde_json::from_value(value).map_err(|e| {
            log::error!(
                "[Api] Failed to deserialize response from {}. Body: {}, Error: {}",
                endpoint,
                body.chars().take(MAX_LOG_BODY_CHARS).collect::<String>(),
                e
            );
            ApiError::Json(e)
        })
    }

    /// List a resource collection.
    ///
    /// GET /{endpoint}?limit={n}&offset={m}&...
    pub async fn list_resource<E: Entity>(&self, query: &ListQuery) -> Result<Vec<E>> {
        let url = self.collection_url::<E>();
        let pairs = query.to_pairs();
        debug!("[Api] GET {} {:?}", url, pairs);

        let mut request = self.client.get(&url).headers(self.headers()?);
        if !pairs.is_empty() {
            request = request.query(&pairs);
        }
        let response = request.send().await?;
        Self::parse_response(response, E::ENDPOINT).await
    }

    /// Fetch one record.
    ///
    /// GET /{endpoint}/{id}
    pub async fn get_resource<E: Entity>(&self, id: &str) -> Result<E> {
        let url = self.item_url::<E>(id);
        let response = self
            .client
            .get(&url)
            .headers(self.headers()?)
            .send()
            .await?;
        Self::parse_response(response, E::ENDPOINT).await
    }

    /// Create a record. Optimistic ids are stripped before sending.
    ///
    /// POST /{endpoint}
    pub async fn create_resource<E: Entity>(&self, draft: &E) -> Result<E> {
        let mut body = serde_json::to_value(draft)?;
        if let Some(fields) = body.as_object_mut() {
            let strip_id = fields
                .get("id")
                .and_then(Value::as_str)
                .map(|id| id.is_empty() || is_optimistic_id(id))
                .unwrap_or(false);
            if strip_id {
                fields.remove("id");
            }
        }

        let response = self
            .client
            .post(self.collection_url::<E>())
            .headers(self.headers()?)
            .json(&body)
            .send()
            .await?;
        Self::parse_response(response, E::ENDPOINT).await
    }

    /// Partially update a record.
    ///
    /// PATCH /{endpoint}/{id}
    pub async fn update_resource<E: Entity>(
        &self,
        id: &str,
        patch: &Map<String, Value>,
    ) -> Result<E> {
        if is_optimistic_id(id) {
            return Err(ApiError::invalid_request(format!(
                "Cannot update unsaved record {}",
                id
            )));
        }
        let response = self
            .client
            .patch(self.item_url::<E>(id))
            .headers(self.headers()?)
            .json(patch)
            .send()
            .await?;
        Self::parse_response(response, E::ENDPOINT).await
    }

    /// Delete a record.
    ///
    /// DELETE /{endpoint}/{id}
    pub async fn delete_resource<E: Entity>(&self, id: &str) -> Result<()> {
        let response = self
            .client
            .delete(self.item_url::<E>(id))
            .headers(self.headers()?)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await?;
        Self::log_response(status, &body);
        Err(ApiError::api(
            status.as_u16(),
            format!("Request failed: {}", body),
        ))
    }
}
