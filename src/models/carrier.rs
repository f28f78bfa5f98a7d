use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Shipping carrier configuration row.
///
/// Carriers are operational configuration maintained by administrators and
/// read-only to the orchestrator at request time. Credentials and endpoints
/// live in `AppConfig`, not here.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "shipping_carriers")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    #[sea_orm(unique)]
    pub code: String,

    pub name: String,

    pub active: bool,

    /// Tie-breaker when two carriers quote the same cost; lower wins.
    pub priority: i32,

    pub supports_cod: bool,
    pub supports_insurance: bool,
    pub supports_international: bool,

    /// Simple rate model: base + per-kg + per-region surcharge.
    pub base_rate: Decimal,
    pub per_kg_rate: Decimal,
    /// Region surcharges keyed by postal-code prefix, e.g. `{"63": 3000}`
    /// for Jeju.
    pub region_surcharges: Json,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    /// Surcharge for a destination postal code, by longest matching prefix.
    pub fn region_surcharge(&self, postal_code: &str) -> Decimal {
        let table: HashMap<String, Decimal> = self
            .region_surcharges
            .as_object()
            .map(|map| {
                map.iter()
                    .filter_map(|(k, v)| {
                        serde_json::from_value::<Decimal>(v.clone())
                            .ok()
                            .map(|d| (k.clone(), d))
                    })
                    .collect()
            })
            .unwrap_or_default();

        table
            .iter()
            .filter(|(prefix, _)| postal_code.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, surcharge)| *surcharge)
            .unwrap_or_default()
    }
}
