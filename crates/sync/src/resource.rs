//! Per-resource sync: cached reads, push-event reconciliation and optimistic
//! writes for one entity type.

use log::{debug, warn};
use serde_json::{Map, Value};
use std::sync::Arc;

use crate::client::QueryClient;
use crate::error::{MutationError, QueryError, QueryResult};
use crate::infinite::InfiniteQuery;
use crate::mutation::MutationScope;
use stockyard_api::{ApiError, ListQuery, ResourceApi};
use stockyard_core::entities::{optimistic_id, Entity};
use stockyard_core::sync::{
    normalize_payload, EntityPatch, EventAction, InsertMode, KeyMatch, ListReconciler, ListView,
    MergeStrategy, ReconcileOutcome, ViewShape,
};
use stockyard_core::{CoreError, QueryKey};
use stockyard_realtime::{SocketChannel, Subscription};

/// How one socket event maps onto the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRule {
    pub event: &'static str,
    pub action: EventAction,
    pub merge: MergeStrategy,
    /// Key the entity is nested under, e.g. `truckDetails`.
    pub details_key: Option<&'static str>,
}

impl EventRule {
    /// `created`/`receive`: the payload is the whole entity.
    pub fn upsert(event: &'static str) -> Self {
        Self {
            event,
            action: EventAction::Upsert,
            merge: MergeStrategy::Replace,
            details_key: None,
        }
    }

    /// `updated`/`status-changed`: the payload may carry only changed fields.
    pub fn patch(event: &'static str) -> Self {
        Self {
            event,
            action: EventAction::Patch,
            merge: MergeStrategy::ShallowMerge,
            details_key: None,
        }
    }

    pub fn remove(event: &'static str) -> Self {
        Self {
            event,
            action: EventAction::Remove,
            merge: MergeStrategy::Replace,
            details_key: None,
        }
    }

    pub fn details(mut self, key: &'static str) -> Self {
        self.details_key = Some(key);
        self
    }

    pub fn merge(mut self, merge: MergeStrategy) -> Self {
        self.merge = merge;
        self
    }
}

/// Declarative description of a resource's cached lists and push events.
pub struct ResourceSpec<E> {
    pub detail_root: QueryKey,
    pub views: Vec<ListView<E>>,
    pub events: Vec<EventRule>,
}

impl<E: Entity> ResourceSpec<E> {
    /// No views or events yet; by-id entries live under `<resource>/detail/<id>`.
    pub fn new() -> Self {
        Self {
            detail_root: QueryKey::new(E::RESOURCE).with("detail"),
            views: Vec::new(),
            events: Vec::new(),
        }
    }

    pub fn view(mut self, view: ListView<E>) -> Self {
        self.views.push(view);
        self
    }

    pub fn on(mut self, rule: EventRule) -> Self {
        self.events.push(rule);
        self
    }

    /// Key of a list view named `name` under this resource.
    pub fn key(name: &str) -> QueryKey {
        QueryKey::new(E::RESOURCE).with(name)
    }
}

impl<E: Entity> Default for ResourceSpec<E> {
    fn default() -> Self {
        Self::new()
    }
}

struct ResourceInner<E: Entity> {
    client: QueryClient,
    api: Arc<dyn ResourceApi<E>>,
    reconciler: ListReconciler<E>,
    events: Vec<EventRule>,
    page_size: u64,
}

impl<E: Entity> ResourceInner<E> {
    fn apply_event(&self, event: &str, payload: &Value) -> Result<ReconcileOutcome, CoreError> {
        let Some(rule) = self.events.iter().find(|rule| rule.event == event) else {
            debug!("[Sync:{}] Ignoring unrelated event '{}'", E::RESOURCE, event);
            return Ok(ReconcileOutcome::default());
        };
        let patch = normalize_payload(event, payload.clone(), rule.details_key)?;
        let cache = self.client.cache();

        let outcome = match rule.action {
            EventAction::Remove => self.reconciler.remove(cache, &patch.id)?,
            EventAction::Upsert | EventAction::Patch => {
                let Some(entity) = self.reconciler.canonicalize(cache, &patch, rule.merge)? else {
                    // Partial update for something we never fetched; let lists refetch.
                    debug!(
                        "[Sync:{}] '{}' for unknown {}; invalidating lists",
                        E::RESOURCE,
                        event,
                        patch.id
                    );
                    self.invalidate_views();
                    return Ok(ReconcileOutcome::default());
                };
                let mode = match rule.action {
                    EventAction::Upsert => InsertMode::Upsert,
                    _ => InsertMode::MembershipOnly,
                };
                self.reconciler.apply(cache, &entity, mode)?
            }
        };

        // Search-style views cannot tell whether a new entity matches them.
        if rule.action == EventAction::Upsert {
            for view in self.reconciler.views() {
                if let KeyMatch::Prefix(prefix) = &view.key {
                    self.client.invalidate_prefix(prefix);
                }
            }
        }
        Ok(outcome)
    }

    fn invalidate_views(&self) {
        for view in self.reconciler.views() {
            match &view.key {
                KeyMatch::Exact(key) => {
                    self.client.invalidate(key);
                }
                KeyMatch::Prefix(prefix) => {
                    self.client.invalidate_prefix(prefix);
                }
            }
        }
    }
}

/// Keeps a resource's socket handlers registered; dropping it unsubscribes.
#[must_use = "dropping a SyncBinding unsubscribes its handlers"]
#[derive(Debug)]
pub struct SyncBinding {
    resource: &'static str,
    subscriptions: Vec<Subscription>,
}

impl SyncBinding {
    pub fn resource(&self) -> &'static str {
        self.resource
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }
}

/// Sync hook for one entity type. Cheap to clone.
pub struct ResourceSync<E: Entity> {
    inner: Arc<ResourceInner<E>>,
}

impl<E: Entity> Clone for ResourceSync<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E: Entity> std::fmt::Debug for ResourceSync<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceSync")
            .field("resource", &E::RESOURCE)
            .field("reconciler", &self.inner.reconciler)
            .field("events", &self.inner.events)
            .finish()
    }
}

impl<E: Entity> ResourceSync<E> {
    pub fn new(
        client: QueryClient,
        api: Arc<dyn ResourceApi<E>>,
        spec: ResourceSpec<E>,
        page_size: u64,
    ) -> Self {
        Self {
            inner: Arc::new(ResourceInner {
                client,
                api,
                reconciler: ListReconciler::new(spec.detail_root, spec.views),
                events: spec.events,
                page_size,
            }),
        }
    }

    pub fn reconciler(&self) -> &ListReconciler<E> {
        &self.inner.reconciler
    }

    pub fn events(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.inner.events.iter().map(|rule| rule.event)
    }

    fn find_view(&self, name: &str, shape: ViewShape) -> QueryResult<&ListView<E>> {
        self.inner
            .reconciler
            .view(name)
            .filter(|view| view.shape == shape)
            .ok_or_else(|| QueryError::unknown_view(E::RESOURCE, name))
    }

    fn list_query(view: &ListView<E>) -> ListQuery {
        view.params
            .iter()
            .fold(ListQuery::new(), |query, (name, value)| query.param(*name, value.clone()))
    }

    async fn fetch_list(
        &self,
        view: &ListView<E>,
        key: QueryKey,
        query: ListQuery,
    ) -> QueryResult<Arc<Vec<E>>> {
        let api = Arc::clone(&self.inner.api);
        let membership = view.membership.clone();
        self.inner
            .client
            .fetch_query(key, move || async move {
                let mut rows = api.list(&query).await?;
                if let Some(member) = membership {
                    rows.retain(|row| member(row));
                }
                Ok::<_, ApiError>(rows)
            })
            .await
    }

    /// Read a plain list view.
    pub async fn list(&self, view: &str) -> QueryResult<Arc<Vec<E>>> {
        let view = self.find_view(view, ViewShape::List)?;
        let KeyMatch::Exact(key) = &view.key else {
            return Err(QueryError::unknown_view(E::RESOURCE, view.name));
        };
        self.fetch_list(view, key.clone(), Self::list_query(view)).await
    }

    /// Cached value of a plain list view, without fetching.
    pub fn peek(&self, view: &str) -> QueryResult<Option<Arc<Vec<E>>>> {
        let view = self.find_view(view, ViewShape::List)?;
        let KeyMatch::Exact(key) = &view.key else {
            return Err(QueryError::unknown_view(E::RESOURCE, view.name));
        };
        self.inner.client.get_query_data::<Vec<E>>(key)
    }

    /// Read one list of a keyed family, e.g. search results for `part`.
    pub async fn list_with(&self, view: &str, part: &str) -> QueryResult<Arc<Vec<E>>> {
        let view = self.find_view(view, ViewShape::List)?;
        let KeyMatch::Prefix(prefix) = &view.key else {
            return Err(QueryError::unknown_view(E::RESOURCE, view.name));
        };
        let mut query = Self::list_query(view);
        if let Some(param) = view.key_param {
            query = query.param(param, part);
        }
        self.fetch_list(view, prefix.clone().with(part), query).await
    }

    /// Read the by-id entry.
    pub async fn detail(&self, id: &str) -> QueryResult<Arc<E>> {
        let api = Arc::clone(&self.inner.api);
        let fetch_id = id.to_string();
        self.inner
            .client
            .fetch_query(self.inner.reconciler.detail_key(id), move || async move {
                api.get(&fetch_id).await
            })
            .await
    }

    /// Paginated handle for a paged view.
    pub fn infinite(&self, view: &str) -> QueryResult<InfiniteQuery<E>> {
        let view = self.find_view(view, ViewShape::Paged)?;
        let KeyMatch::Exact(key) = &view.key else {
            return Err(QueryError::unknown_view(E::RESOURCE, view.name));
        };
        Ok(InfiniteQuery::new(
            self.inner.client.clone(),
            Arc::clone(&self.inner.api),
            key.clone(),
            Self::list_query(view),
            self.inner.page_size,
        )
        .with_membership(view.membership.clone()))
    }

    /// Reconcile one push event into every affected cache key.
    pub fn apply_event(&self, event: &str, payload: &Value) -> Result<ReconcileOutcome, CoreError> {
        self.inner.apply_event(event, payload)
    }

    /// Register a handler per event rule on `channel`.
    pub fn bind(&self, channel: &SocketChannel) -> SyncBinding {
        let subscriptions = self
            .inner
            .events
            .iter()
            .map(|rule| {
                let inner = Arc::clone(&self.inner);
                let event = rule.event;
                channel.on(event, move |payload: &Value| {
                    if let Err(err) = inner.apply_event(event, payload) {
                        warn!("[Sync:{}] Dropped '{}': {}", E::RESOURCE, event, err);
                    }
                })
            })
            .collect();
        debug!("[Sync:{}] Bound to socket", E::RESOURCE);
        SyncBinding {
            resource: E::RESOURCE,
            subscriptions,
        }
    }

    /// Optimistically insert `draft` under a temporary id, then swap in the
    /// server's entity. Every touched key is restored if the request fails.
    pub async fn create(&self, draft: E) -> Result<E, MutationError> {
        let inner = &self.inner;
        let cache = inner.client.cache();
        let keys = inner.reconciler.affected_keys(cache, None);
        let mut scope = MutationScope::begin(&inner.client, format!("create {}", E::RESOURCE), keys);

        let mut optimistic = draft.clone();
        let temp_id = optimistic_id();
        optimistic.set_id(temp_id.clone());
        scope.track(inner.reconciler.detail_key(&temp_id));
        inner.reconciler.apply(cache, &optimistic, InsertMode::Upsert)?;

        let result = inner.api.create(&draft).await;
        let outcome = match result {
            Ok(created) => {
                inner.reconciler.remove(cache, &temp_id)?;
                inner.reconciler.apply(cache, &created, InsertMode::Upsert)?;
                scope.track(inner.reconciler.detail_key(created.id()));
                Ok(created)
            }
            Err(err) => {
                scope.rollback();
                Err(rolled_back(E::RESOURCE, "create", err))
            }
        };
        scope.settle();
        outcome
    }

    /// Optimistically merge `changes` into the cached entity, then apply the
    /// server's response.
    pub async fn update(&self, id: &str, changes: Map<String, Value>) -> Result<E, MutationError> {
        let inner = &self.inner;
        let cache = inner.client.cache();
        let keys = inner.reconciler.affected_keys(cache, Some(id));
        let mut scope = MutationScope::begin(&inner.client, format!("update {}", id), keys);

        let patch = EntityPatch {
            id: id.to_string(),
            fields: changes.clone(),
        };
        let applied = match inner.reconciler.find(cache, id)? {
            Some(existing) => {
                let optimistic = patch.merge_into(&existing)?;
                inner.reconciler.apply(cache, &optimistic, InsertMode::MembershipOnly)?;
                true
            }
            None => false,
        };

        let result = inner.api.update(id, &changes).await;
        let outcome = match result {
            Ok(updated) => {
                inner.reconciler.apply(cache, &updated, InsertMode::MembershipOnly)?;
                Ok(updated)
            }
            Err(err) if applied => {
                scope.rollback();
                Err(rolled_back(E::RESOURCE, "update", err))
            }
            Err(err) => Err(MutationError::Api(err)),
        };
        scope.settle();
        outcome
    }

    /// Optimistically drop `id` everywhere, restoring it if the request fails.
    pub async fn delete(&self, id: &str) -> Result<(), MutationError> {
        let inner = &self.inner;
        let cache = inner.client.cache();
        let keys = inner.reconciler.affected_keys(cache, Some(id));
        let mut scope = MutationScope::begin(&inner.client, format!("delete {}", id), keys);

        let removed = inner.reconciler.remove(cache, id)?;
        let outcome = match inner.api.delete(id).await {
            Ok(()) => Ok(()),
            Err(err) if !removed.is_noop() => {
                scope.rollback();
                Err(rolled_back(E::RESOURCE, "delete", err))
            }
            Err(err) => Err(MutationError::Api(err)),
        };
        scope.settle();
        outcome
    }
}

fn rolled_back(resource: &str, action: &str, err: ApiError) -> MutationError {
    warn!("[Mutation] {} {} failed: {}", action, resource, err);
    MutationError::RolledBack { source: err }
}
