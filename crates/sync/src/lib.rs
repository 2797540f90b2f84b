//! Client-side cache sync for the Stockyard warehouse app.
//!
//! Ties the query cache, the REST client and the realtime socket together:
//! list and detail queries are fetched through a [`QueryClient`], push events
//! are reconciled into cached lists by each [`ResourceSync`], and mutations
//! run optimistically inside a [`MutationScope`].

pub mod catalog;
mod client;
mod config;
mod context;
mod error;
mod infinite;
mod mutation;
mod resource;

pub use client::QueryClient;
pub use config::{
    SyncConfig, ACCESS_TOKEN_VAR, API_URL_VAR, PAGE_SIZE_VAR, SOCKET_URL_VAR, STALE_SECS_VAR,
};
pub use context::SyncContext;
pub use error::{ConfigError, MutationError, QueryError, QueryResult};
pub use infinite::InfiniteQuery;
pub use mutation::MutationScope;
pub use resource::{EventRule, ResourceSpec, ResourceSync, SyncBinding};
