use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Order boundary entity.
///
/// Orders are owned by the checkout subsystem; this service only reads them
/// for weight and address-snapshot data, and writes back `tracking_number`
/// and `delivered_at` as shipments progress.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "orders")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    #[sea_orm(unique)]
    pub order_number: String,

    pub status: String,

    pub customer_name: String,
    pub customer_phone: Option<String>,
    pub shipping_address: String,
    pub postal_code: String,

    /// Line items: `[{sku, name, quantity, weight_kg, declared_value}]`.
    pub items: Json,

    /// Tracking reference of the order's active shipment, if any.
    pub tracking_number: Option<String>,

    pub delivered_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::shipment::Entity")]
    Shipments,
}

impl Related<super::shipment::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Shipments.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

/// Typed view over one entry of the `items` JSON column.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderItem {
    pub sku: String,
    #[serde(default)]
    pub name: Option<String>,
    pub quantity: u32,
    pub weight_kg: f32,
    #[serde(default)]
    pub declared_value: Option<Decimal>,
}

impl Model {
    /// Deserializes the line items, skipping entries that do not parse.
    pub fn parsed_items(&self) -> Vec<OrderItem> {
        match self.items.as_array() {
            Some(values) => values
                .iter()
                .filter_map(|v| serde_json::from_value(v.clone()).ok())
                .collect(),
            None => Vec::new(),
        }
    }

    /// Total parcel weight in kilograms across all line items.
    pub fn total_weight_kg(&self) -> f32 {
        self.parsed_items()
            .iter()
            .map(|item| item.weight_kg * item.quantity as f32)
            .sum()
    }
}
