use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{id_from_string_or_number, impl_entity};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TruckStatus {
    Pending,
    Loading,
    Dispatched,
    Completed,
}

/// A truck at the gate, being loaded or out on delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Truck {
    #[serde(deserialize_with = "id_from_string_or_number")]
    pub id: String,
    #[serde(default)]
    pub truck_number: Option<String>,
    #[serde(default)]
    pub driver_name: Option<String>,
    #[serde(default)]
    pub driver_phone: Option<String>,
    pub status: TruckStatus,
    #[serde(default)]
    pub dispatch_order_id: Option<String>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl_entity!(Truck, "trucks", "truck");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchOrderStatus {
    Pending,
    Dispatched,
    Delivered,
    Cancelled,
}

/// Customer order shipped out of the warehouse.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchOrder {
    #[serde(deserialize_with = "id_from_string_or_number")]
    pub id: String,
    #[serde(default)]
    pub customer_name: Option<String>,
    pub status: DispatchOrderStatus,
    #[serde(default)]
    pub truck_id: Option<String>,
    #[serde(default)]
    pub items: Vec<Value>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl_entity!(DispatchOrder, "dispatch-orders", "dispatch-order");
