//! REST client for the Stockyard warehouse API.
//!
//! Provides typed access to the resource endpoints the sync layer reads from
//! and writes to.

mod client;
mod error;
mod resource;

pub use client::{reject_empty_or_null, ApiClient, ListQuery};
pub use error::{ApiError, ApiRetryClass, Result};
pub use resource::ResourceApi;
