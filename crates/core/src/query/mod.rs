//! Query keys and the keyed query cache.

mod cache;
mod key;

pub use cache::*;
pub use key::*;
