//! Stockyard core: domain entities, the query cache store and the generic
//! reconciler that keeps cached lists consistent with push events.
//!
//! Nothing in this crate performs I/O.

pub mod entities;
pub mod errors;
pub mod query;
pub mod sync;

pub use entities::Entity;
pub use errors::{CoreError, Result};
pub use query::{QueryCache, QueryKey};
