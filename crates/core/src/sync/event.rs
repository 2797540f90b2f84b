//! Socket event envelopes and payload normalization.
//!
//! Push payloads arrive in several shapes: the bare entity, the entity nested
//! under a `<name>Details` key, or with a Mongo-style `_id`. Everything is
//! reduced to an [`EntityPatch`] here so the reconciler sees one shape.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::entities::Entity;
use crate::errors::{CoreError, Result};

/// A named event delivered by the socket channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SocketEnvelope {
    pub event_name: String,
    pub payload: Value,
}

impl SocketEnvelope {
    pub fn new(event_name: impl Into<String>, payload: Value) -> Self {
        Self {
            event_name: event_name.into(),
            payload,
        }
    }
}

/// What a push event means for the cached collections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventAction {
    /// Insert if missing, replace if present (`created`, `receive`).
    Upsert,
    /// Update in place; insert only into filtered lists the entity now belongs to.
    Patch,
    /// Drop the entity from every list and its by-id entry.
    Remove,
}

/// How an incoming patch is combined with the cached entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    /// The payload is the whole entity.
    Replace,
    /// Payload fields overwrite the cached fields, others are kept.
    ShallowMerge,
}

/// Canonical entity change extracted from a push payload.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityPatch {
    pub id: String,
    pub fields: Map<String, Value>,
}

impl EntityPatch {
    pub fn from_entity<E: Entity>(entity: &E) -> Result<Self> {
        match serde_json::to_value(entity)? {
            Value::Object(fields) => Ok(Self {
                id: entity.id().to_string(),
                fields,
            }),
            _ => Err(CoreError::normalize(E::RESOURCE, "entity is not a JSON object")),
        }
    }

    /// Try to read the patch as a complete entity.
    pub fn to_entity<E: Entity>(&self) -> Option<E> {
        serde_json::from_value(Value::Object(self.fields.clone())).ok()
    }

    /// Overlay the patch fields on top of `base`.
    pub fn merge_into<E: Entity>(&self, base: &E) -> Result<E> {
        let mut merged = match serde_json::to_value(base)? {
            Value::Object(fields) => fields,
            _ => Map::new(),
        };
        for (name, value) in &self.fields {
            merged.insert(name.clone(), value.clone());
        }
        Ok(serde_json::from_value(Value::Object(merged))?)
    }
}

fn id_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(id) if !id.is_empty() => Some(id.clone()),
        Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}

/// Unwrap a nested `<name>Details` object. With no explicit key, a single
/// object-valued key ending in `Details` is unwrapped.
fn unwrap_details(payload: Value, details_key: Option<&str>) -> Value {
    let Value::Object(mut fields) = payload else {
        return payload;
    };

    let key = match details_key {
        Some(key) => fields.contains_key(key).then(|| key.to_string()),
        None => {
            let mut nested = fields
                .iter()
                .filter(|(name, value)| name.ends_with("Details") && value.is_object())
                .map(|(name, _)| name.clone());
            match (nested.next(), nested.next()) {
                (Some(only), None) => Some(only),
                _ => None,
            }
        }
    };

    match key.and_then(|key| fields.remove(&key)) {
        Some(inner @ Value::Object(_)) => inner,
        Some(other) => other,
        None => Value::Object(fields),
    }
}

/// Reduce a raw event payload to an [`EntityPatch`].
pub fn normalize_payload(
    event: &str,
    payload: Value,
    details_key: Option<&str>,
) -> Result<EntityPatch> {
    let Value::Object(mut fields) = unwrap_details(payload, details_key) else {
        return Err(CoreError::normalize(event, "payload is not an object"));
    };

    let id = fields
        .get("id")
        .and_then(id_to_string)
        .or_else(|| fields.get("_id").and_then(id_to_string))
        .ok_or_else(|| CoreError::normalize(event, "payload has no id"))?;

    fields.remove("_id");
    fields.insert("id".to_string(), Value::String(id.clone()));

    Ok(EntityPatch { id, fields })
}
