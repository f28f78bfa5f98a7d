use chrono::{DateTime, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, EntityTrait, QueryFilter, QueryOrder, Set,
};
use std::sync::Arc;
use uuid::Uuid;

use crate::db::DbPool;
use crate::errors::ServiceError;
use crate::models::{carrier, order, shipment};

/// Fields applied together with a status transition.
#[derive(Debug, Default)]
pub struct StatusUpdate {
    pub new_status: shipment::ShipmentStatus,
    pub current_location: Option<String>,
    pub tracking_events: Option<serde_json::Value>,
    pub estimated_delivery: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
    pub set_shipped_at: bool,
    pub set_delivered_at: bool,
}

/// Persistence boundary for shipment records.
///
/// All status writes go through the conditional-update methods so that the
/// poller and webhook ingestion, which race on the same rows, can never
/// clobber each other with stale data.
#[derive(Clone)]
pub struct ShipmentStore {
    db: Arc<DbPool>,
}

impl ShipmentStore {
    pub fn new(db: Arc<DbPool>) -> Self {
        Self { db }
    }

    pub async fn insert(
        &self,
        model: shipment::ActiveModel,
    ) -> Result<shipment::Model, ServiceError> {
        Ok(model.insert(&*self.db).await?)
    }

    pub async fn find_by_tracking(
        &self,
        tracking_number: &str,
    ) -> Result<Option<shipment::Model>, ServiceError> {
        Ok(shipment::Entity::find()
            .filter(shipment::Column::TrackingNumber.eq(tracking_number))
            .one(&*self.db)
            .await?)
    }

    /// All shipments for an order, newest first.
    pub async fn find_for_order(
        &self,
        order_id: Uuid,
    ) -> Result<Vec<shipment::Model>, ServiceError> {
        Ok(shipment::Entity::find()
            .filter(shipment::Column::OrderId.eq(order_id))
            .order_by_desc(shipment::Column::CreatedAt)
            .all(&*self.db)
            .await?)
    }

    /// Whether the order already has a shipment occupying its active slot.
    pub async fn has_active_shipment(&self, order_id: Uuid) -> Result<bool, ServiceError> {
        let rows = self.find_for_order(order_id).await?;
        Ok(rows.iter().any(|s| s.is_active()))
    }

    /// Every shipment still in a non-terminal status, the poller's work set.
    pub async fn list_non_terminal(&self) -> Result<Vec<shipment::Model>, ServiceError> {
        use shipment::ShipmentStatus::*;
        Ok(shipment::Entity::find()
            .filter(shipment::Column::Status.is_not_in([Delivered, Failed, Returned, Cancelled]))
            .all(&*self.db)
            .await?)
    }

    pub async fn list_created_between(
        &self,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Vec<shipment::Model>, ServiceError> {
        let mut query = shipment::Entity::find();
        if let Some(from) = from {
            query = query.filter(shipment::Column::CreatedAt.gte(from));
        }
        if let Some(to) = to {
            query = query.filter(shipment::Column::CreatedAt.lte(to));
        }
        Ok(query.all(&*self.db).await?)
    }

    /// Compare-and-set status transition: the UPDATE is guarded on the status
    /// the caller read, so a concurrent writer that already advanced the row
    /// makes this a no-op. Returns whether the row was updated.
    pub async fn transition_status(
        &self,
        current: &shipment::Model,
        update: StatusUpdate,
    ) -> Result<bool, ServiceError> {
        let now = Utc::now();
        let mut active = shipment::ActiveModel {
            status: Set(update.new_status),
            updated_at: Set(now),
            ..Default::default()
        };
        if let Some(location) = update.current_location {
            active.current_location = Set(Some(location));
        }
        if let Some(events) = update.tracking_events {
            active.tracking_events = Set(events);
        }
        if let Some(eta) = update.estimated_delivery {
            active.estimated_delivery = Set(Some(eta));
        }
        if let Some(reason) = update.failure_reason {
            active.failure_reason = Set(Some(reason));
        }
        if update.set_shipped_at && current.shipped_at.is_none() {
            active.shipped_at = Set(Some(now));
        }
        if update.set_delivered_at {
            active.delivered_at = Set(Some(now));
        }

        let result = shipment::Entity::update_many()
            .set(active)
            .filter(shipment::Column::Id.eq(current.id))
            .filter(shipment::Column::Status.eq(current.status))
            .exec(&*self.db)
            .await?;
        Ok(result.rows_affected == 1)
    }

    /// Atomic cancellation guard: the pending check and the write are one
    /// conditional UPDATE, so a shipment picked up an instant earlier cannot
    /// be cancelled. Returns whether the row was cancelled.
    pub async fn cancel_if_pending(&self, id: Uuid) -> Result<bool, ServiceError> {
        let active = shipment::ActiveModel {
            status: Set(shipment::ShipmentStatus::Cancelled),
            updated_at: Set(Utc::now()),
            ..Default::default()
        };
        let result = shipment::Entity::update_many()
            .set(active)
            .filter(shipment::Column::Id.eq(id))
            .filter(shipment::Column::Status.eq(shipment::ShipmentStatus::Pending))
            .exec(&*self.db)
            .await?;
        Ok(result.rows_affected == 1)
    }

    // --- Order boundary -------------------------------------------------

    pub async fn find_order(&self, order_id: Uuid) -> Result<Option<order::Model>, ServiceError> {
        Ok(order::Entity::find_by_id(order_id).one(&*self.db).await?)
    }

    pub async fn set_order_tracking(
        &self,
        order_id: Uuid,
        tracking_number: Option<String>,
    ) -> Result<(), ServiceError> {
        let active = order::ActiveModel {
            id: Set(order_id),
            tracking_number: Set(tracking_number),
            updated_at: Set(Utc::now()),
            ..Default::default()
        };
        active.update(&*self.db).await?;
        Ok(())
    }

    pub async fn mark_order_delivered(&self, order_id: Uuid) -> Result<(), ServiceError> {
        let now = Utc::now();
        let active = order::ActiveModel {
            id: Set(order_id),
            status: Set("delivered".to_string()),
            delivered_at: Set(Some(now)),
            updated_at: Set(now),
            ..Default::default()
        };
        active.update(&*self.db).await?;
        Ok(())
    }

    // --- Carrier configuration -------------------------------------------

    pub async fn list_active_carriers(&self) -> Result<Vec<carrier::Model>, ServiceError> {
        Ok(carrier::Entity::find()
            .filter(carrier::Column::Active.eq(true))
            .order_by_asc(carrier::Column::Priority)
            .all(&*self.db)
            .await?)
    }
}
