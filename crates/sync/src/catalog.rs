//! List views and socket events of every warehouse resource.

use stockyard_core::entities::{
    CalendarEvent, ChamberStock, Contractor, DispatchOrder, DispatchOrderStatus, Package,
    PackageStatus, Production, ProductionStatus, RawMaterialOrder, RawMaterialOrderStatus, Truck,
    TruckStatus, User, Vendor,
};
use stockyard_core::sync::{InsertPosition, ListView, MergeStrategy};

use crate::resource::{EventRule, ResourceSpec};

/// View names shared across resources.
pub mod views {
    pub const ALL: &str = "all";
    pub const PENDING: &str = "pending";
    pub const IN_PROGRESS: &str = "in_progress";
    pub const COMPLETED: &str = "completed";
    pub const ACTIVE: &str = "active";
    pub const SEARCH: &str = "search";
    pub const BY_CHAMBER: &str = "by_chamber";
}

use views::*;

pub fn raw_material_orders() -> ResourceSpec<RawMaterialOrder> {
    type S = ResourceSpec<RawMaterialOrder>;
    S::new()
        .view(ListView::list(ALL, S::key(ALL)))
        .view(
            ListView::list(PENDING, S::key(PENDING))
                .member_if(|order: &RawMaterialOrder| {
                    order.status == RawMaterialOrderStatus::Pending
                })
                .param("status", "pending"),
        )
        .view(
            ListView::paged(COMPLETED, S::key(COMPLETED))
                .member_if(|order: &RawMaterialOrder| {
                    order.status == RawMaterialOrderStatus::Completed
                })
                .param("status", "completed"),
        )
        .on(EventRule::upsert("raw-material-order:created"))
        .on(EventRule::patch("raw-material-order:status-changed"))
        .on(EventRule::patch("raw-material-order:updated"))
}

pub fn chamber_stock() -> ResourceSpec<ChamberStock> {
    type S = ResourceSpec<ChamberStock>;
    S::new()
        .view(ListView::list(ALL, S::key(ALL)))
        .view(ListView::prefixed(BY_CHAMBER, S::key("chamber"), "chamber"))
        // a receipt may be a new row or new totals for an existing one
        .on(EventRule::upsert("chamber-stock:receive").merge(MergeStrategy::ShallowMerge))
}

pub fn production() -> ResourceSpec<Production> {
    type S = ResourceSpec<Production>;
    S::new()
        .view(ListView::list(ALL, S::key(ALL)))
        .view(
            ListView::list(PENDING, S::key(PENDING))
                .member_if(|p: &Production| p.status == ProductionStatus::Pending)
                .param("status", "pending"),
        )
        .view(
            ListView::list(IN_PROGRESS, S::key(IN_PROGRESS))
                .member_if(|p: &Production| p.status == ProductionStatus::InProgress)
                .param("status", "in_progress"),
        )
        .view(
            ListView::paged(COMPLETED, S::key(COMPLETED))
                .member_if(|p: &Production| p.status == ProductionStatus::Completed)
                .param("status", "completed"),
        )
        .on(EventRule::upsert("production:created"))
        .on(EventRule::patch("production:status-changed"))
}

pub fn trucks() -> ResourceSpec<Truck> {
    type S = ResourceSpec<Truck>;
    S::new()
        .view(ListView::list(ALL, S::key(ALL)))
        .view(
            ListView::list(ACTIVE, S::key(ACTIVE))
                .member_if(|truck: &Truck| truck.status != TruckStatus::Completed),
        )
        .on(EventRule::upsert("Truck:receive").details("truckDetails"))
}

pub fn vendors() -> ResourceSpec<Vendor> {
    type S = ResourceSpec<Vendor>;
    S::new()
        .view(ListView::list(ALL, S::key(ALL)))
        .view(
            ListView::list(ACTIVE, S::key(ACTIVE))
                .member_if(|vendor: &Vendor| vendor.is_active)
                .param("is_active", "true"),
        )
        .view(ListView::prefixed(SEARCH, S::key(SEARCH), "search"))
        .on(EventRule::upsert("vendor:created"))
        .on(EventRule::patch("vendor:updated"))
        .on(EventRule::remove("vendor:deleted"))
}

pub fn packages() -> ResourceSpec<Package> {
    type S = ResourceSpec<Package>;
    S::new()
        .view(ListView::paged(ALL, S::key(ALL)))
        .view(
            ListView::list(PENDING, S::key(PENDING))
                .member_if(|package: &Package| package.status == PackageStatus::Pending)
                .param("status", "pending"),
        )
        .on(EventRule::upsert("package:receive"))
}

pub fn dispatch_orders() -> ResourceSpec<DispatchOrder> {
    type S = ResourceSpec<DispatchOrder>;
    S::new()
        .view(ListView::paged(ALL, S::key(ALL)))
        .view(
            ListView::list(PENDING, S::key(PENDING))
                .member_if(|order: &DispatchOrder| order.status == DispatchOrderStatus::Pending)
                .param("status", "pending"),
        )
        .on(EventRule::upsert("dispatchOrder:created").details("dispatchOrderDetails"))
        .on(EventRule::patch("dispatchOrder:update").details("dispatchOrderDetails"))
}

pub fn users() -> ResourceSpec<User> {
    type S = ResourceSpec<User>;
    S::new()
        .view(ListView::list(ALL, S::key(ALL)))
        .on(EventRule::upsert("user:created"))
        .on(EventRule::patch("user:updated"))
}

pub fn contractors() -> ResourceSpec<Contractor> {
    type S = ResourceSpec<Contractor>;
    S::new()
        .view(ListView::list(ALL, S::key(ALL)))
        .view(
            ListView::list(ACTIVE, S::key(ACTIVE))
                .member_if(|contractor: &Contractor| contractor.is_active)
                .param("is_active", "true"),
        )
        .on(EventRule::upsert("contractor:created"))
        .on(EventRule::patch("contractor:updated"))
}

pub fn calendar_events() -> ResourceSpec<CalendarEvent> {
    type S = ResourceSpec<CalendarEvent>;
    S::new()
        .view(ListView::list(ALL, S::key(ALL)).insert_at(InsertPosition::Append))
        .on(EventRule::upsert("calendar:created"))
        .on(EventRule::patch("calendar:updated"))
        .on(EventRule::remove("calendar:deleted"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::QueryClient;
    use crate::error::MutationError;
    use crate::resource::ResourceSync;
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use serde_json::{json, Map, Value};
    use std::collections::HashSet;
    use std::sync::{Arc, Mutex};
    use stockyard_api::{ApiError, ListQuery, ResourceApi};
    use stockyard_core::sync::{EntityPatch, EventAction, ViewShape};
    use stockyard_core::entities::is_optimistic_id;
    use stockyard_core::{Entity, QueryKey};
    use tokio::sync::oneshot;

    /// In-memory backend: filters rows by query params and slices by offset.
    struct MemoryApi<E> {
        rows: Mutex<Vec<E>>,
        fail_writes: bool,
        gate: Mutex<Option<oneshot::Receiver<()>>>,
    }

    impl<E: Entity> MemoryApi<E> {
        fn new(rows: Vec<E>) -> Self {
            Self {
                rows: Mutex::new(rows),
                fail_writes: false,
                gate: Mutex::new(None),
            }
        }

        fn matches(row: &E, query: &ListQuery) -> bool {
            let Ok(value) = serde_json::to_value(row) else {
                return false;
            };
            query.params.iter().all(|(name, expected)| match &value[name] {
                Value::String(actual) => actual == expected,
                other => other.to_string() == *expected,
            })
        }

        async fn write(&self) -> stockyard_api::Result<()> {
            let gate = self.gate.lock().expect("lock").take();
            if let Some(gate) = gate {
                let _ = gate.await;
            }
            if self.fail_writes {
                return Err(ApiError::api(500, "write rejected"));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl<E: Entity> ResourceApi<E> for MemoryApi<E> {
        async fn list(&self, query: &ListQuery) -> stockyard_api::Result<Vec<E>> {
            let rows = self.rows.lock().expect("lock");
            let offset = query.offset.unwrap_or(0) as usize;
            let limit = query.limit.map(|l| l as usize).unwrap_or(usize::MAX);
            Ok(rows
                .iter()
                .filter(|row| Self::matches(row, query))
                .skip(offset)
                .take(limit)
                .cloned()
                .collect())
        }

        async fn get(&self, id: &str) -> stockyard_api::Result<E> {
            self.rows
                .lock()
                .expect("lock")
                .iter()
                .find(|row| row.id() == id)
                .cloned()
                .ok_or_else(|| ApiError::api(404, "not found"))
        }

        async fn create(&self, draft: &E) -> stockyard_api::Result<E> {
            self.write().await?;
            let mut created = draft.clone();
            created.set_id(format!("srv-{}", self.rows.lock().expect("lock").len() + 1));
            self.rows.lock().expect("lock").push(created.clone());
            Ok(created)
        }

        async fn update(&self, id: &str, patch: &Map<String, Value>) -> stockyard_api::Result<E> {
            self.write().await?;
            let existing = self.get(id).await?;
            EntityPatch {
                id: id.to_string(),
                fields: patch.clone(),
            }
            .merge_into(&existing)
            .map_err(|err| ApiError::invalid_request(err.to_string()))
        }

        async fn delete(&self, id: &str) -> stockyard_api::Result<()> {
            self.write().await?;
            self.rows.lock().expect("lock").retain(|row| row.id() != id);
            Ok(())
        }
    }

    fn resource<E: Entity>(
        spec: ResourceSpec<E>,
        api: MemoryApi<E>,
        page_size: u64,
    ) -> ResourceSync<E> {
        ResourceSync::new(QueryClient::default(), Arc::new(api), spec, page_size)
    }

    fn from_json<E: Entity>(value: Value) -> E {
        serde_json::from_value(value).expect("entity")
    }

    fn cached<E: Entity>(sync: &ResourceSync<E>, view: &str) -> Option<Vec<E>> {
        sync.peek(view)
            .expect("plain list view")
            .map(|list| (*list).clone())
    }

    #[test]
    fn event_names_are_unique_across_resources() {
        let names: Vec<&str> = [
            raw_material_orders().events,
            chamber_stock().events,
            production().events,
            trucks().events,
            vendors().events,
            packages().events,
            dispatch_orders().events,
            users().events,
            contractors().events,
            calendar_events().events,
        ]
        .into_iter()
        .flatten()
        .map(|rule| rule.event)
        .collect();
        let unique: HashSet<&str> = names.iter().copied().collect();
        assert_eq!(names.len(), unique.len());
        assert_eq!(names.len(), 20);
    }

    #[test]
    fn nested_payload_events_declare_their_details_key() {
        let truck = trucks();
        assert_eq!(truck.events[0].details_key, Some("truckDetails"));
        let dispatch = dispatch_orders();
        assert!(dispatch
            .events
            .iter()
            .all(|rule| rule.details_key == Some("dispatchOrderDetails")));
    }

    #[test]
    fn paged_views_are_declared_where_lists_grow_unbounded() {
        let spec = raw_material_orders();
        let completed = spec
            .views
            .iter()
            .find(|view| view.name == COMPLETED)
            .expect("completed view");
        assert_eq!(completed.shape, ViewShape::Paged);
        assert!(packages().views.iter().any(|v| v.shape == ViewShape::Paged));
    }

    #[tokio::test]
    async fn created_order_lands_in_empty_pending_list_once() {
        let orders = resource(raw_material_orders(), MemoryApi::new(Vec::new()), 20);
        assert!(orders.list(PENDING).await.expect("pending").is_empty());

        let payload = json!({ "id": "rm-1", "status": "pending", "quantity_ordered": 50 });
        orders
            .apply_event("raw-material-order:created", &payload)
            .expect("created");
        orders
            .apply_event("raw-material-order:created", &payload)
            .expect("replayed");

        let pending = cached(&orders, PENDING).expect("pending cached");
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, "rm-1");
        assert_eq!(pending[0].quantity_ordered, dec!(50));
        // never fetched, so never created by an event
        assert!(cached(&orders, ALL).is_none());
    }

    #[tokio::test]
    async fn status_change_leaves_pending_but_stays_in_all_and_detail() {
        let order: RawMaterialOrder = from_json(json!({
            "id": "rm-1",
            "status": "pending",
            "quantity_ordered": 50,
            "raw_material_name": "Potatoes"
        }));
        let orders = resource(raw_material_orders(), MemoryApi::new(vec![order]), 20);
        orders.list(ALL).await.expect("all");
        assert_eq!(orders.list(PENDING).await.expect("pending").len(), 1);
        orders.detail("rm-1").await.expect("detail");

        orders
            .apply_event(
                "raw-material-order:status-changed",
                &json!({ "id": "rm-1", "status": "completed" }),
            )
            .expect("status change");

        assert!(cached(&orders, PENDING).expect("pending").is_empty());
        let all = cached(&orders, ALL).expect("all");
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].status, RawMaterialOrderStatus::Completed);
        assert_eq!(all[0].raw_material_name.as_deref(), Some("Potatoes"));

        let detail = orders.detail("rm-1").await.expect("cached detail");
        assert_eq!(detail.status, RawMaterialOrderStatus::Completed);
    }

    #[tokio::test]
    async fn rejected_vendor_rename_reverts_exactly() {
        let acme: Vendor = from_json(json!({ "id": "v1", "name": "Acme" }));
        let (release, gate) = oneshot::channel();
        let api = MemoryApi {
            fail_writes: true,
            gate: Mutex::new(Some(gate)),
            ..MemoryApi::new(vec![acme.clone()])
        };
        let vendors = resource(vendors(), api, 20);
        vendors.list(ALL).await.expect("all");

        let mut changes = Map::new();
        changes.insert("name".to_string(), json!("Acme Corp"));
        let rename = vendors.update("v1", changes);
        let observe = async {
            tokio::task::yield_now().await;
            let during = cached(&vendors, ALL).expect("all");
            assert_eq!(during[0].name, "Acme Corp");
            let _ = release.send(());
        };
        let (result, _) = tokio::join!(rename, observe);

        assert!(matches!(result, Err(MutationError::RolledBack { .. })));
        assert_eq!(cached(&vendors, ALL).expect("all"), vec![acme]);
    }

    #[tokio::test]
    async fn replayed_package_receive_keeps_one_entry_with_latest_fields() {
        let packages = resource(packages(), MemoryApi::new(Vec::new()), 20);
        packages.list(PENDING).await.expect("pending");
        let all = packages.infinite(ALL).expect("paged view");
        all.fetch().await.expect("first page");

        packages
            .apply_event(
                "package:receive",
                &json!({ "id": "p1", "status": "pending", "quantity": 4 }),
            )
            .expect("first delivery");
        packages
            .apply_event(
                "package:receive",
                &json!({ "id": "p1", "status": "pending", "quantity": 6 }),
            )
            .expect("second delivery");

        let pending = cached(&packages, PENDING).expect("pending");
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].quantity, dec!(6));
        let items = all.items();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].quantity, dec!(6));
    }

    #[tokio::test]
    async fn paged_dispatch_orders_have_unique_ids_and_stop_on_short_page() {
        let rows: Vec<DispatchOrder> = (1..=5)
            .map(|n| from_json(json!({ "id": format!("do-{}", n), "status": "pending" })))
            .collect();
        let orders = resource(dispatch_orders(), MemoryApi::new(rows), 2);
        let all = orders.infinite(ALL).expect("paged view");

        all.fetch().await.expect("page 1");
        while all.has_next_page() {
            assert!(all.fetch_next_page().await.expect("next page"));
        }

        let ids: Vec<String> = all.items().into_iter().map(|order| order.id).collect();
        let unique: HashSet<&String> = ids.iter().collect();
        assert_eq!(ids.len(), 5);
        assert_eq!(unique.len(), 5);
        let data = all.data().expect("pages");
        assert!(data.pages.last().expect("last page").data.len() < 2);
    }

    #[tokio::test]
    async fn truck_receive_unwraps_details_and_tracks_active_trucks() {
        let trucks = resource(trucks(), MemoryApi::new(Vec::new()), 20);
        trucks.list(ACTIVE).await.expect("active");

        trucks
            .apply_event(
                "Truck:receive",
                &json!({ "truckDetails": { "id": 7, "status": "loading", "truck_number": "MH12" } }),
            )
            .expect("arrived");
        assert_eq!(cached(&trucks, ACTIVE).expect("active")[0].id, "7");

        trucks
            .apply_event(
                "Truck:receive",
                &json!({ "truckDetails": { "id": 7, "status": "completed" } }),
            )
            .expect("completed");
        assert!(cached(&trucks, ACTIVE).expect("active").is_empty());
    }

    #[tokio::test]
    async fn active_trucks_fetch_drops_completed_rows() {
        let rows: Vec<Truck> = vec![
            from_json(json!({ "id": "t1", "status": "completed" })),
            from_json(json!({ "id": "t2", "status": "loading" })),
        ];
        let trucks = resource(trucks(), MemoryApi::new(rows), 20);

        let active = trucks.list(ACTIVE).await.expect("active");
        let ids: Vec<&str> = active.iter().map(|truck| truck.id.as_str()).collect();
        assert_eq!(ids, vec!["t2"]);
        assert_eq!(trucks.list(ALL).await.expect("all").len(), 2);
    }

    #[tokio::test]
    async fn rejected_package_create_restores_every_list() {
        let received: Package = from_json(json!({ "id": "p1", "status": "pending", "quantity": 4 }));
        let api = MemoryApi {
            fail_writes: true,
            ..MemoryApi::new(vec![received])
        };
        let client = QueryClient::default();
        let packages = ResourceSync::new(client.clone(), Arc::new(api), packages(), 20);
        packages.list(PENDING).await.expect("pending");
        let all = packages.infinite(ALL).expect("paged view");
        all.fetch().await.expect("first page");
        let pending_before = cached(&packages, PENDING);
        let pages_before = all.data();

        let draft: Package = from_json(json!({ "id": "", "status": "pending", "quantity": 9 }));
        let err = packages.create(draft).await.expect_err("rejected");

        assert!(err.is_rolled_back());
        assert_eq!(cached(&packages, PENDING), pending_before);
        assert_eq!(all.data(), pages_before);
        let leaked: Vec<_> = client
            .cache()
            .keys_with_prefix(&QueryKey::new(Package::RESOURCE))
            .into_iter()
            .filter(|key| key.parts().iter().any(|part| is_optimistic_id(part)))
            .collect();
        assert!(leaked.is_empty(), "optimistic keys left: {:?}", leaked);
        assert!(all.items().iter().all(|p| !is_optimistic_id(&p.id)));
    }

    #[test]
    fn vendor_delete_removes() {
        let spec = vendors();
        let rule = spec
            .events
            .iter()
            .find(|rule| rule.event == "vendor:deleted")
            .expect("delete rule");
        assert_eq!(rule.action, EventAction::Remove);
    }
}
