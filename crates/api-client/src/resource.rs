//! Typed per-resource API seam consumed by the sync layer.

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::client::{ApiClient, ListQuery};
use crate::error::Result;
use stockyard_core::entities::Entity;

/// CRUD operations for one resource type.
#[async_trait]
pub trait ResourceApi<E: Entity>: Send + Sync {
    async fn list(&self, query: &ListQuery) -> Result<Vec<E>>;

    async fn get(&self, id: &str) -> Result<E>;

    async fn create(&self, draft: &E) -> Result<E>;

    async fn update(&self, id: &str, patch: &Map<String, Value>) -> Result<E>;

    async fn delete(&self, id: &str) -> Result<()>;
}

#[async_trait]
impl<E: Entity> ResourceApi<E> for ApiClient {
    async fn list(&self, query: &ListQuery) -> Result<Vec<E>> {
        self.list_resource::<E>(query).await
    }

    async fn get(&self, id: &str) -> Result<E> {
        self.get_resource::<E>(id).await
    }

    async fn create(&self, draft: &E) -> Result<E> {
        self.create_resource(draft).await
    }

    async fn update(&self, id: &str, patch: &Map<String, Value>) -> Result<E> {
        self.update_resource::<E>(id, patch).await
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.delete_resource::<E>(id).await
    }
}
