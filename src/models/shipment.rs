use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use sea_orm::Set;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use utoipa::ToSchema;
use uuid::Uuid;

/// Canonical, carrier-independent shipment lifecycle.
///
/// Every connector maps its carrier-native vocabulary into these values
/// before anything downstream sees them. `cancelled` is a first-class
/// member and, like the other end states, is terminal.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    ToSchema,
    EnumIter,
    DeriveActiveEnum,
)]
#[sea_orm(rs_type = "String", db_type = "Text")]
#[serde(rename_all = "snake_case")]
pub enum ShipmentStatus {
    #[default]
    #[sea_orm(string_value = "pending")]
    Pending,
    #[sea_orm(string_value = "picked_up")]
    PickedUp,
    #[sea_orm(string_value = "in_transit")]
    InTransit,
    #[sea_orm(string_value = "out_for_delivery")]
    OutForDelivery,
    #[sea_orm(string_value = "delivered")]
    Delivered,
    #[sea_orm(string_value = "failed")]
    Failed,
    #[sea_orm(string_value = "returned")]
    Returned,
    #[sea_orm(string_value = "cancelled")]
    Cancelled,
}

impl ShipmentStatus {
    /// Terminal statuses accept no further transition.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Delivered | Self::Failed | Self::Returned | Self::Cancelled
        )
    }

    /// Position along the happy path, used to reject regressions when a
    /// stale poll result races a webhook that already advanced the row.
    fn progress_rank(&self) -> Option<u8> {
        match self {
            Self::Pending => Some(0),
            Self::PickedUp => Some(1),
            Self::InTransit => Some(2),
            Self::OutForDelivery => Some(3),
            Self::Delivered => Some(4),
            _ => None,
        }
    }

    /// Whether the canonical state machine permits `self -> next`.
    ///
    /// Forward jumps along the happy path are allowed (carriers skip
    /// milestones), regressions and transitions out of a terminal status
    /// are not. `failed`/`returned` are reachable from any non-terminal
    /// status; `cancelled` only from `pending`.
    pub fn can_transition_to(&self, next: ShipmentStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            ShipmentStatus::Cancelled => *self == ShipmentStatus::Pending,
            ShipmentStatus::Failed | ShipmentStatus::Returned => true,
            _ => match (self.progress_rank(), next.progress_rank()) {
                (Some(cur), Some(nxt)) => nxt > cur,
                _ => false,
            },
        }
    }
}

impl fmt::Display for ShipmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::PickedUp => "picked_up",
            Self::InTransit => "in_transit",
            Self::OutForDelivery => "out_for_delivery",
            Self::Delivered => "delivered",
            Self::Failed => "failed",
            Self::Returned => "returned",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for ShipmentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "picked_up" => Ok(Self::PickedUp),
            "in_transit" => Ok(Self::InTransit),
            "out_for_delivery" => Ok(Self::OutForDelivery),
            "delivered" => Ok(Self::Delivered),
            "failed" => Ok(Self::Failed),
            "returned" => Ok(Self::Returned),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown shipment status '{}'", other)),
        }
    }
}

/// Shipment entity: one row per carrier-assigned parcel. Rows are a durable
/// audit trail and are never deleted.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "shipments")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub order_id: Uuid,

    pub carrier_code: String,

    /// Carrier-issued identifier. Assigned once at label creation and
    /// immutable thereafter.
    #[sea_orm(unique)]
    pub tracking_number: Option<String>,

    pub status: ShipmentStatus,

    // Sender/recipient snapshot, copied from the order at label creation.
    // Never re-derived afterwards, so later order edits cannot leak in.
    pub sender_name: String,
    pub sender_phone: Option<String>,
    pub sender_address: String,
    pub sender_postal_code: String,
    pub recipient_name: String,
    pub recipient_phone: Option<String>,
    pub recipient_address: String,
    pub recipient_postal_code: String,

    pub shipping_cost: Option<Decimal>,
    pub insurance_amount: Option<Decimal>,

    pub weight_kg: f32,
    pub dimensions_cm: Option<String>,

    /// Last carrier-reported location.
    pub current_location: Option<String>,
    /// Raw carrier tracking event history. Open payload, kept for
    /// audit/debugging; control flow never reads it.
    pub tracking_events: Json,
    pub label_url: Option<String>,
    pub failure_reason: Option<String>,

    pub estimated_delivery: Option<DateTime<Utc>>,
    pub shipped_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::order::Entity",
        from = "Column::OrderId",
        to = "super::order::Column::Id"
    )]
    Order,
}

impl Related<super::order::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Order.def()
    }
}

#[async_trait::async_trait]
impl ActiveModelBehavior for ActiveModel {
    async fn before_save<C: ConnectionTrait>(self, _db: &C, insert: bool) -> Result<Self, DbErr> {
        let mut active = self;
        if insert {
            if let sea_orm::ActiveValue::NotSet = active.id {
                active.id = Set(Uuid::new_v4());
            }
        }
        Ok(active)
    }
}

impl Model {
    /// A shipment still occupying the order's single active slot. Cancelled,
    /// failed and returned shipments free the slot for a re-shipment;
    /// delivered shipments keep it occupied until a return is processed.
    pub fn is_active(&self) -> bool {
        !matches!(
            self.status,
            ShipmentStatus::Cancelled | ShipmentStatus::Failed | ShipmentStatus::Returned
        )
    }
}
