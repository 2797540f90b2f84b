//! Generic list reconciler.
//!
//! One instance per resource, parameterized by the resource's list views
//! (key, shape, membership predicate, insert position). Given a canonical
//! entity it fans the change out to every cache key that could hold it:
//! replace in place, drop on membership loss, insert on membership gain.

use log::debug;
use std::fmt;
use std::sync::Arc;

use super::event::{EntityPatch, MergeStrategy};
use super::pagination::{InfiniteData, Page};
use crate::entities::Entity;
use crate::errors::Result;
use crate::query::{QueryCache, QueryKey};

/// Predicate deciding whether an entity belongs in a list.
pub type Membership<E> = Arc<dyn Fn(&E) -> bool + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertPosition {
    Prepend,
    Append,
    /// Only entities already in the list are updated (e.g. search results).
    Never,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewShape {
    /// Cached as `Vec<E>`.
    List,
    /// Cached as `InfiniteData<E>`.
    Paged,
}

/// Which cache keys a view covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyMatch {
    Exact(QueryKey),
    /// Every cached key under the prefix, e.g. one per search text.
    Prefix(QueryKey),
}

/// A cached list of a resource and its membership rule.
pub struct ListView<E> {
    pub name: &'static str,
    pub key: KeyMatch,
    pub shape: ViewShape,
    pub membership: Option<Membership<E>>,
    pub insert: InsertPosition,
    /// REST query parameters that select this list server-side.
    pub params: Vec<(&'static str, String)>,
    /// Query parameter carrying the extra key part of a prefix view.
    pub key_param: Option<&'static str>,
}

impl<E> ListView<E> {
    pub fn list(name: &'static str, key: QueryKey) -> Self {
        Self {
            name,
            key: KeyMatch::Exact(key),
            shape: ViewShape::List,
            membership: None,
            insert: InsertPosition::Prepend,
            params: Vec::new(),
            key_param: None,
        }
    }

    pub fn paged(name: &'static str, key: QueryKey) -> Self {
        Self {
            shape: ViewShape::Paged,
            ..Self::list(name, key)
        }
    }

    /// A family of lists keyed under `prefix`, one per value of `key_param`.
    pub fn prefixed(name: &'static str, prefix: QueryKey, key_param: &'static str) -> Self {
        Self {
            key: KeyMatch::Prefix(prefix),
            insert: InsertPosition::Never,
            key_param: Some(key_param),
            ..Self::list(name, QueryKey::new(""))
        }
    }

    pub fn member_if(mut self, predicate: impl Fn(&E) -> bool + Send + Sync + 'static) -> Self {
        self.membership = Some(Arc::new(predicate));
        self
    }

    pub fn insert_at(mut self, insert: InsertPosition) -> Self {
        self.insert = insert;
        self
    }

    pub fn param(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.params.push((name, value.into()));
        self
    }

    pub fn accepts(&self, entity: &E) -> bool {
        self.membership
            .as_ref()
            .map(|predicate| predicate(entity))
            .unwrap_or(true)
    }

    pub fn is_filtered(&self) -> bool {
        self.membership.is_some()
    }

    /// Keys of this view currently present in the cache.
    pub fn cached_keys(&self, cache: &QueryCache) -> Vec<QueryKey> {
        match &self.key {
            KeyMatch::Exact(key) => vec![key.clone()],
            KeyMatch::Prefix(prefix) => cache
                .keys_with_prefix(prefix)
                .into_iter()
                .filter(|key| key.parts().len() > prefix.parts().len())
                .collect(),
        }
    }
}

impl<E> fmt::Debug for ListView<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListView")
            .field("name", &self.name)
            .field("key", &self.key)
            .field("shape", &self.shape)
            .field("filtered", &self.membership.is_some())
            .field("insert", &self.insert)
            .finish()
    }
}

/// Whether entities absent from an unfiltered list may be inserted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertMode {
    /// `created`/`receive` semantics: insert wherever membership holds.
    Upsert,
    /// Update semantics: only filtered lists the entity moved into gain it.
    MembershipOnly,
}

/// Keys written by one reconciliation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub inserted: Vec<QueryKey>,
    pub replaced: Vec<QueryKey>,
    pub removed: Vec<QueryKey>,
}

impl ReconcileOutcome {
    pub fn is_noop(&self) -> bool {
        self.inserted.is_empty() && self.replaced.is_empty() && self.removed.is_empty()
    }

    pub fn touched(&self) -> impl Iterator<Item = &QueryKey> {
        self.inserted
            .iter()
            .chain(self.replaced.iter())
            .chain(self.removed.iter())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListChange {
    Inserted,
    Replaced,
    Removed,
}

/// Reconcile one entity into a plain list. `None` means "leave unchanged".
pub fn reconcile_list<E: Entity>(
    list: &[E],
    entity: &E,
    member: bool,
    insert: Option<InsertPosition>,
) -> Option<Vec<E>> {
    reconcile_list_change(list, entity, member, insert).map(|(next, _)| next)
}

fn reconcile_list_change<E: Entity>(
    list: &[E],
    entity: &E,
    member: bool,
    insert: Option<InsertPosition>,
) -> Option<(Vec<E>, ListChange)> {
    match list.iter().position(|item| item.id() == entity.id()) {
        Some(idx) if member => {
            if &list[idx] == entity {
                return None;
            }
            let mut next = list.to_vec();
            next[idx] = entity.clone();
            Some((next, ListChange::Replaced))
        }
        Some(idx) => {
            let mut next = list.to_vec();
            next.remove(idx);
            Some((next, ListChange::Removed))
        }
        None if member => {
            let mut next = list.to_vec();
            match insert? {
                InsertPosition::Prepend => next.insert(0, entity.clone()),
                InsertPosition::Append => next.push(entity.clone()),
                InsertPosition::Never => return None,
            }
            Some((next, ListChange::Inserted))
        }
        None => None,
    }
}

fn reconcile_pages<E: Entity>(
    data: &InfiniteData<E>,
    entity: &E,
    member: bool,
    insert: Option<InsertPosition>,
) -> Option<(InfiniteData<E>, ListChange)> {
    let mut next = data.clone();
    match data.position(entity.id()) {
        Some((page, idx)) if member => {
            if &data.pages[page].data[idx] == entity {
                return None;
            }
            next.pages[page].data[idx] = entity.clone();
            Some((next, ListChange::Replaced))
        }
        Some((page, idx)) => {
            next.pages[page].data.remove(idx);
            Some((next, ListChange::Removed))
        }
        None if member => {
            match insert? {
                InsertPosition::Prepend => match next.pages.first_mut() {
                    Some(first) => first.data.insert(0, entity.clone()),
                    None => {
                        next.pages.push(Page {
                            data: vec![entity.clone()],
                            next_offset: None,
                        });
                        next.page_params.push(0);
                    }
                },
                // appended items only belong on screen once the last page is loaded
                InsertPosition::Append if !data.has_next_page() => match next.pages.last_mut() {
                    Some(last) => last.data.push(entity.clone()),
                    None => return None,
                },
                InsertPosition::Append | InsertPosition::Never => return None,
            }
            Some((next, ListChange::Inserted))
        }
        None => None,
    }
}

/// Fan-out of entity changes for one resource.
pub struct ListReconciler<E> {
    resource: &'static str,
    detail_root: QueryKey,
    views: Vec<ListView<E>>,
}

impl<E> fmt::Debug for ListReconciler<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListReconciler")
            .field("resource", &self.resource)
            .field("detail_root", &self.detail_root)
            .field("views", &self.views)
            .finish()
    }
}

impl<E: Entity> ListReconciler<E> {
    pub fn new(detail_root: QueryKey, views: Vec<ListView<E>>) -> Self {
        Self {
            resource: E::RESOURCE,
            detail_root,
            views,
        }
    }

    pub fn views(&self) -> &[ListView<E>] {
        &self.views
    }

    pub fn view(&self, name: &str) -> Option<&ListView<E>> {
        self.views.iter().find(|view| view.name == name)
    }

    pub fn detail_key(&self, id: &str) -> QueryKey {
        self.detail_root.clone().with(id)
    }

    /// Every cached key a change to `id` may touch: all list keys present in
    /// the cache plus the by-id key.
    pub fn affected_keys(&self, cache: &QueryCache, id: Option<&str>) -> Vec<QueryKey> {
        let mut keys: Vec<QueryKey> = self
            .views
            .iter()
            .flat_map(|view| view.cached_keys(cache))
            .collect();
        if let Some(id) = id {
            keys.push(self.detail_key(id));
        }
        keys.dedup();
        keys
    }

    /// Current cached copy of `id`: by-id entry first, then any list.
    pub fn find(&self, cache: &QueryCache, id: &str) -> Result<Option<E>> {
        if let Some(entity) = cache.get_data::<E>(&self.detail_key(id))? {
            return Ok(Some((*entity).clone()));
        }
        for view in &self.views {
            for key in view.cached_keys(cache) {
                let found = match view.shape {
                    ViewShape::List => cache
                        .get_data::<Vec<E>>(&key)?
                        .and_then(|list| list.iter().find(|item| item.id() == id).cloned()),
                    ViewShape::Paged => cache
                        .get_data::<InfiniteData<E>>(&key)?
                        .and_then(|data| data.items().find(|item| item.id() == id).cloned()),
                };
                if found.is_some() {
                    return Ok(found);
                }
            }
        }
        Ok(None)
    }

    /// Combine a patch with whatever is cached for its id.
    ///
    /// Returns `None` when the patch is partial and nothing is cached to merge
    /// it into.
    pub fn canonicalize(
        &self,
        cache: &QueryCache,
        patch: &EntityPatch,
        strategy: MergeStrategy,
    ) -> Result<Option<E>> {
        let existing = self.find(cache, &patch.id)?;
        let full = match strategy {
            MergeStrategy::Replace => patch.to_entity::<E>(),
            MergeStrategy::ShallowMerge => None,
        };
        Ok(match (full, existing) {
            (Some(entity), _) => Some(entity),
            (None, Some(existing)) => Some(patch.merge_into(&existing)?),
            (None, None) => patch.to_entity::<E>(),
        })
    }

    /// Write `entity` into every view and the by-id entry.
    pub fn apply(&self, cache: &QueryCache, entity: &E, mode: InsertMode) -> Result<ReconcileOutcome> {
        let mut outcome = ReconcileOutcome::default();

        for view in &self.views {
            let member = view.accepts(entity);
            let insert = match mode {
                InsertMode::Upsert => Some(view.insert),
                InsertMode::MembershipOnly if view.is_filtered() => Some(view.insert),
                InsertMode::MembershipOnly => None,
            };

            for key in view.cached_keys(cache) {
                let change = match view.shape {
                    ViewShape::List => self.apply_list(cache, &key, entity, member, insert)?,
                    ViewShape::Paged => self.apply_paged(cache, &key, entity, member, insert)?,
                };
                match change {
                    Some(ListChange::Inserted) => outcome.inserted.push(key),
                    Some(ListChange::Replaced) => outcome.replaced.push(key),
                    Some(ListChange::Removed) => outcome.removed.push(key),
                    None => {}
                }
            }
        }

        let detail_key = self.detail_key(entity.id());
        let replaced = cache.update_existing::<E, _>(&detail_key, |current| {
            (current != entity).then(|| entity.clone())
        })?;
        if replaced {
            outcome.replaced.push(detail_key);
        }

        debug!(
            "[Sync:{}] Reconciled {}: inserted={} replaced={} removed={}",
            self.resource,
            entity.id(),
            outcome.inserted.len(),
            outcome.replaced.len(),
            outcome.removed.len()
        );
        Ok(outcome)
    }

    fn apply_list(
        &self,
        cache: &QueryCache,
        key: &QueryKey,
        entity: &E,
        member: bool,
        insert: Option<InsertPosition>,
    ) -> Result<Option<ListChange>> {
        // Lists nobody has fetched stay absent; a one-item list would look fresh.
        let mut change = None;
        cache.update_existing::<Vec<E>, _>(key, |list| {
            reconcile_list_change(list, entity, member, insert).map(|(next, kind)| {
                change = Some(kind);
                next
            })
        })?;
        Ok(change)
    }

    fn apply_paged(
        &self,
        cache: &QueryCache,
        key: &QueryKey,
        entity: &E,
        member: bool,
        insert: Option<InsertPosition>,
    ) -> Result<Option<ListChange>> {
        let mut change = None;
        cache.update_existing::<InfiniteData<E>, _>(key, |data| {
            reconcile_pages(data, entity, member, insert).map(|(next, kind)| {
                change = Some(kind);
                next
            })
        })?;
        Ok(change)
    }

    /// Drop `id` from every view and evict its by-id entry.
    pub fn remove(&self, cache: &QueryCache, id: &str) -> Result<ReconcileOutcome> {
        let mut outcome = ReconcileOutcome::default();
        for view in &self.views {
            for key in view.cached_keys(cache) {
                let removed = match view.shape {
                    ViewShape::List => cache.update_existing::<Vec<E>, _>(&key, |list| {
                        list.iter().any(|item| item.id() == id).then(|| {
                            list.iter().filter(|item| item.id() != id).cloned().collect()
                        })
                    })?,
                    ViewShape::Paged => {
                        cache.update_existing::<InfiniteData<E>, _>(&key, |data| {
                            data.position(id).map(|(page, idx)| {
                                let mut next = data.clone();
                                next.pages[page].data.remove(idx);
                                next
                            })
                        })?
                    }
                };
                if removed {
                    outcome.removed.push(key);
                }
            }
        }
        let detail_key = self.detail_key(id);
        if cache.remove(&detail_key).is_some() {
            outcome.removed.push(detail_key);
        }
        debug!(
            "[Sync:{}] Removed {} from {} keys",
            self.resource,
            id,
            outcome.removed.len()
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{RawMaterialOrder, RawMaterialOrderStatus};
    use crate::sync::event::normalize_payload;
    use serde_json::json;

    fn order(id: &str, status: &str) -> RawMaterialOrder {
        serde_json::from_value(json!({ "id": id, "status": status, "quantity_ordered": 50 }))
            .expect("order")
    }

    fn reconciler() -> ListReconciler<RawMaterialOrder> {
        ListReconciler::new(
            QueryKey::new("raw-material-order"),
            vec![
                ListView::list("pending", QueryKey::new("raw-material-orders").with("pending"))
                    .member_if(|o: &RawMaterialOrder| o.status == RawMaterialOrderStatus::Pending),
                ListView::list("all", QueryKey::new("raw-material-orders").with("all")),
                ListView::paged(
                    "completed",
                    QueryKey::new("raw-material-orders").with("completed"),
                )
                .member_if(|o: &RawMaterialOrder| o.status == RawMaterialOrderStatus::Completed),
            ],
        )
    }

    fn list(cache: &QueryCache, view: &str) -> Vec<RawMaterialOrder> {
        let key = QueryKey::new("raw-material-orders").with(view);
        cache
            .get_data::<Vec<RawMaterialOrder>>(&key)
            .expect("typed")
            .map(|list| (*list).clone())
            .unwrap_or_default()
    }

    #[test]
    fn reconcile_list_replaces_without_reordering() {
        let current = vec![order("a", "pending"), order("b", "pending"), order("c", "pending")];
        let mut updated = order("b", "pending");
        updated.unit = Some("kg".to_string());

        let next = reconcile_list(&current, &updated, true, Some(InsertPosition::Prepend))
            .expect("changed");
        let ids: Vec<&str> = next.iter().map(|o| o.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert_eq!(next[1].unit.as_deref(), Some("kg"));
    }

    #[test]
    fn reconcile_list_is_noop_for_identical_entity() {
        let current = vec![order("a", "pending")];
        assert!(reconcile_list(&current, &order("a", "pending"), true, None).is_none());
    }

    #[test]
    fn created_event_inserts_once() {
        let cache = QueryCache::new();
        cache.set(
            QueryKey::new("raw-material-orders").with("pending"),
            Vec::<RawMaterialOrder>::new(),
        );
        let reconciler = reconciler();
        let created = order("rm-1", "pending");

        reconciler.apply(&cache, &created, InsertMode::Upsert).expect("first");
        reconciler.apply(&cache, &created, InsertMode::Upsert).expect("replay");

        let pending = list(&cache, "pending");
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, "rm-1");
    }

    #[test]
    fn status_change_moves_entity_out_of_filtered_list() {
        let cache = QueryCache::new();
        let reconciler = reconciler();
        cache.set(
            QueryKey::new("raw-material-orders").with("pending"),
            vec![order("rm-1", "pending")],
        );
        cache.set(
            QueryKey::new("raw-material-orders").with("all"),
            vec![order("rm-1", "pending")],
        );
        cache.set(QueryKey::new("raw-material-order").with("rm-1"), order("rm-1", "pending"));

        let patch = normalize_payload(
            "raw-material-order:status-changed",
            json!({ "id": "rm-1", "status": "completed" }),
            None,
        )
        .expect("patch");
        let entity = reconciler
            .canonicalize(&cache, &patch, MergeStrategy::ShallowMerge)
            .expect("canonicalize")
            .expect("entity");
        let outcome = reconciler
            .apply(&cache, &entity, InsertMode::MembershipOnly)
            .expect("apply");

        assert!(list(&cache, "pending").is_empty());
        assert_eq!(list(&cache, "all")[0].status, RawMaterialOrderStatus::Completed);
        let detail = cache
            .get_data::<RawMaterialOrder>(&QueryKey::new("raw-material-order").with("rm-1"))
            .expect("typed")
            .expect("detail");
        assert_eq!(detail.status, RawMaterialOrderStatus::Completed);
        assert_eq!(outcome.removed.len(), 1);
    }

    #[test]
    fn status_change_into_filter_inserts_into_paged_list() {
        let cache = QueryCache::new();
        let reconciler = reconciler();
        let key = QueryKey::new("raw-material-orders").with("completed");
        cache.set(
            key.clone(),
            InfiniteData::first(Page::from_fetch(vec![order("old", "completed")], 0, 20), 0),
        );

        reconciler
            .apply(&cache, &order("rm-2", "completed"), InsertMode::MembershipOnly)
            .expect("apply");

        let data = cache
            .get_data::<InfiniteData<RawMaterialOrder>>(&key)
            .expect("typed")
            .expect("pages");
        let ids: Vec<&str> = data.items().map(|o| o.id.as_str()).collect();
        assert_eq!(ids, vec!["rm-2", "old"]);
    }

    #[test]
    fn update_mode_does_not_insert_into_unfiltered_list() {
        let cache = QueryCache::new();
        let reconciler = reconciler();
        cache.set(
            QueryKey::new("raw-material-orders").with("all"),
            Vec::<RawMaterialOrder>::new(),
        );

        reconciler
            .apply(&cache, &order("rm-3", "cancelled"), InsertMode::MembershipOnly)
            .expect("apply");
        assert!(list(&cache, "all").is_empty());
    }

    #[test]
    fn remove_clears_lists_and_detail() {
        let cache = QueryCache::new();
        let reconciler = reconciler();
        cache.set(
            QueryKey::new("raw-material-orders").with("all"),
            vec![order("rm-1", "pending"), order("rm-2", "pending")],
        );
        cache.set(QueryKey::new("raw-material-order").with("rm-1"), order("rm-1", "pending"));

        let outcome = reconciler.remove(&cache, "rm-1").expect("remove");
        assert_eq!(outcome.removed.len(), 2);
        assert_eq!(list(&cache, "all").len(), 1);
        assert!(cache
            .get(&QueryKey::new("raw-material-order").with("rm-1"))
            .is_none());
    }

    #[test]
    fn prefixed_views_only_update_existing_members() {
        let cache = QueryCache::new();
        let reconciler: ListReconciler<RawMaterialOrder> = ListReconciler::new(
            QueryKey::new("raw-material-order"),
            vec![ListView::prefixed(
                "search",
                QueryKey::new("raw-material-orders").with("search"),
                "search",
            )],
        );
        let search_key = QueryKey::new("raw-material-orders").with("search").with("sugar");
        cache.set(search_key.clone(), vec![order("rm-1", "pending")]);

        reconciler
            .apply(&cache, &order("rm-1", "completed"), InsertMode::Upsert)
            .expect("update");
        reconciler
            .apply(&cache, &order("rm-9", "pending"), InsertMode::Upsert)
            .expect("unrelated");

        let results = cache
            .get_data::<Vec<RawMaterialOrder>>(&search_key)
            .expect("typed")
            .expect("results");
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].status, RawMaterialOrderStatus::Completed);
    }
}
