use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{id_from_string_or_number, impl_entity};

/// Lifecycle of a raw-material purchase order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RawMaterialOrderStatus {
    Pending,
    InTransit,
    Completed,
    Cancelled,
}

/// Raw material ordered from a vendor, received into a chamber.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawMaterialOrder {
    #[serde(deserialize_with = "id_from_string_or_number")]
    pub id: String,
    #[serde(default)]
    pub raw_material_name: Option<String>,
    #[serde(default)]
    pub vendor_id: Option<String>,
    pub status: RawMaterialOrderStatus,
    #[serde(default)]
    pub quantity_ordered: Decimal,
    #[serde(default)]
    pub quantity_received: Option<Decimal>,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl_entity!(RawMaterialOrder, "raw-material-orders", "raw-material/order");

/// Current stock of one product inside a cold-storage chamber.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChamberStock {
    #[serde(deserialize_with = "id_from_string_or_number")]
    pub id: String,
    pub chamber_name: String,
    #[serde(default)]
    pub product_name: Option<String>,
    #[serde(default)]
    pub quantity: Decimal,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl_entity!(ChamberStock, "chamber-stock", "chamber-stock");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProductionStatus {
    Pending,
    InProgress,
    Completed,
}

/// A production run turning chamber stock into finished product.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Production {
    #[serde(deserialize_with = "id_from_string_or_number")]
    pub id: String,
    #[serde(default)]
    pub product_name: Option<String>,
    pub status: ProductionStatus,
    #[serde(default)]
    pub quantity: Decimal,
    #[serde(default)]
    pub chamber_id: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl_entity!(Production, "production", "production");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PackageStatus {
    Pending,
    Packed,
    Dispatched,
}

/// Packed finished goods waiting for dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Package {
    #[serde(deserialize_with = "id_from_string_or_number")]
    pub id: String,
    #[serde(default)]
    pub product_name: Option<String>,
    #[serde(default)]
    pub package_type: Option<String>,
    pub status: PackageStatus,
    #[serde(default)]
    pub quantity: Decimal,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl_entity!(Package, "packages", "package");

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    #[test]
    fn raw_material_order_accepts_minimal_payload() {
        let order: RawMaterialOrder = serde_json::from_value(json!({
            "id": "rm-1",
            "status": "pending",
            "quantity_ordered": 50
        }))
        .expect("order");
        assert_eq!(order.status, RawMaterialOrderStatus::Pending);
        assert_eq!(order.quantity_ordered, dec!(50));
        assert!(order.raw_material_name.is_none());
    }

    #[test]
    fn production_status_uses_snake_case() {
        let value = serde_json::to_value(ProductionStatus::InProgress).expect("status");
        assert_eq!(value, json!("in_progress"));
    }
}
