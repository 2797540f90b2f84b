//! Domain entities mirrored from the warehouse backend.
//!
//! The client never owns these shapes; it only keeps copies of what the REST
//! API and the socket channel deliver. Unknown server fields are preserved in
//! each entity's `extra` map so a merge never drops data.

macro_rules! impl_entity {
    ($ty:ty, $resource:literal, $endpoint:literal) => {
        impl $crate::entities::Entity for $ty {
            const RESOURCE: &'static str = $resource;
            const ENDPOINT: &'static str = $endpoint;

            fn id(&self) -> &str {
                &self.id
            }

            fn set_id(&mut self, id: String) {
                self.id = id;
            }
        }
    };
}

pub(crate) use impl_entity;

mod directory;
mod inventory;
mod logistics;

pub use directory::*;
pub use inventory::*;
pub use logistics::*;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt::Debug;
use uuid::Uuid;

/// Prefix for ids synthesized by optimistic creates.
pub const OPTIMISTIC_ID_PREFIX: &str = "optimistic-";

/// A server-defined record with a stable id used as the reconciliation key.
pub trait Entity:
    Clone + Debug + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Root of every query key for this resource.
    const RESOURCE: &'static str;
    /// REST collection path.
    const ENDPOINT: &'static str;

    fn id(&self) -> &str;

    fn set_id(&mut self, id: String);
}

/// Generate a temporary id for an entity that does not exist server-side yet.
pub fn optimistic_id() -> String {
    format!("{}{}", OPTIMISTIC_ID_PREFIX, Uuid::new_v4())
}

pub fn is_optimistic_id(id: &str) -> bool {
    id.starts_with(OPTIMISTIC_ID_PREFIX)
}

/// Accept ids sent either as JSON strings or numbers.
pub(crate) fn id_from_string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Text(String),
        Number(i64),
    }

    Ok(match RawId::deserialize(deserializer)? {
        RawId::Text(value) => value,
        RawId::Number(value) => value.to_string(),
    })
}
