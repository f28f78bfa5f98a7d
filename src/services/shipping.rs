use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use hmac::{Hmac, Mac};
use rust_decimal::Decimal;
use sea_orm::Set;
use serde::Serialize;
use serde_json::json;
use sha2::Sha256;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::carriers::{CarrierRegistry, LabelOptions, Party, RateQuote};
use crate::config::AppConfig;
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::models::order::OrderItem;
use crate::models::shipment::{self, ShipmentStatus};
use crate::services::store::{ShipmentStore, StatusUpdate};

/// Outcome of one full tracking sweep.
#[derive(Debug, Clone, Copy, Default, Serialize, ToSchema)]
pub struct TrackingSweepSummary {
    pub total: usize,
    pub refreshed: usize,
    pub failed: usize,
    /// Non-terminal rows that could not be refreshed at all (no tracking
    /// number assigned).
    pub skipped: usize,
}

/// Per-order outcome within a bulk label request.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct BulkLabelEntry {
    pub order_id: Uuid,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tracking_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct BulkLabelResult {
    pub results: Vec<BulkLabelEntry>,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct CarrierStats {
    pub carrier_code: String,
    pub count: usize,
    #[schema(value_type = Option<f64>)]
    pub avg_cost: Option<Decimal>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct StatusCount {
    pub status: ShipmentStatus,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ShippingStats {
    pub total: usize,
    pub by_carrier: Vec<CarrierStats>,
    pub by_status: Vec<StatusCount>,
}

/// The shipping orchestrator: rate shopping, label issuance, tracking
/// refresh, cancellation and webhook dispatch. Receives its carrier
/// registry at construction so tests can inject doubles per carrier.
#[derive(Clone)]
pub struct ShippingService {
    store: ShipmentStore,
    registry: Arc<CarrierRegistry>,
    event_sender: EventSender,
    sender: Party,
    quote_timeout: Duration,
    tracking_concurrency: usize,
    /// Per-shipment locks serializing poll/webhook writers on the same row.
    shipment_locks: Arc<DashMap<Uuid, Arc<Mutex<()>>>>,
    /// Per-order locks serializing label creation. Label issuance is
    /// carrier-billed and not idempotent, so the active-slot check and the
    /// row insert must not interleave between two requests for one order.
    order_locks: Arc<DashMap<Uuid, Arc<Mutex<()>>>>,
}

fn keyed_lock(locks: &DashMap<Uuid, Arc<Mutex<()>>>, key: Uuid) -> Arc<Mutex<()>> {
    locks
        .entry(key)
        .or_insert_with(|| Arc::new(Mutex::new(())))
        .clone()
}

impl ShippingService {
    pub fn new(
        store: ShipmentStore,
        registry: Arc<CarrierRegistry>,
        event_sender: EventSender,
        config: &AppConfig,
    ) -> Self {
        let sender = Party {
            name: config.sender.name.clone(),
            phone: config.sender.phone.clone(),
            address: config.sender.address.clone(),
            postal_code: config.sender.postal_code.clone(),
        };
        Self {
            store,
            registry,
            event_sender,
            sender,
            quote_timeout: Duration::from_secs(config.carrier_quote_timeout_secs),
            tracking_concurrency: config.tracking_concurrency.max(1),
            shipment_locks: Arc::new(DashMap::new()),
            order_locks: Arc::new(DashMap::new()),
        }
    }

    /// Queries every registered connector concurrently and returns the
    /// available quotes sorted ascending by cost. One carrier timing out or
    /// failing only removes that carrier from the result.
    #[instrument(skip(self))]
    pub async fn calculate_rates(&self, order_id: Uuid) -> Result<Vec<RateQuote>, ServiceError> {
        let order = self
            .store
            .find_order(order_id)
            .await?
            .ok_or(ServiceError::OrderNotFound(order_id))?;

        let weight = order.total_weight_kg();
        let items: Vec<OrderItem> = order.parsed_items();
        let destination = order.postal_code.clone();

        let quote_futures: Vec<_> = self
            .registry
            .connectors()
            .map(|connector| {
                let connector = connector.clone();
                let items = items.clone();
                let destination = destination.clone();
                let timeout = self.quote_timeout;
                async move {
                    match tokio::time::timeout(
                        timeout,
                        connector.quote(weight, &destination, &items),
                    )
                    .await
                    {
                        Ok(Ok(quote)) => quote,
                        Ok(Err(e)) => {
                            warn!(carrier = connector.code(), error = %e, "quote failed");
                            None
                        }
                        Err(_) => {
                            warn!(carrier = connector.code(), "quote timed out");
                            None
                        }
                    }
                }
            })
            .collect();

        let mut rates: Vec<RateQuote> = futures::future::join_all(quote_futures)
            .await
            .into_iter()
            .flatten()
            .collect();

        rates.sort_by(|a, b| a.cost.cmp(&b.cost).then(a.priority.cmp(&b.priority)));
        Ok(rates)
    }

    /// Issues a label with the chosen carrier and persists the shipment.
    ///
    /// The carrier call happens before any row is written: a failed carrier
    /// call leaves no partial shipment behind. Conversely, if persisting
    /// fails after the carrier issued a label, the label is cancelled
    /// best-effort so the order is not silently billed.
    #[instrument(skip(self, options))]
    pub async fn create_label(
        &self,
        order_id: Uuid,
        carrier_code: &str,
        options: LabelOptions,
    ) -> Result<shipment::Model, ServiceError> {
        let order = self
            .store
            .find_order(order_id)
            .await?
            .ok_or(ServiceError::OrderNotFound(order_id))?;
        let connector = self.registry.get(carrier_code)?;
        let profile = connector.profile();

        if options.cod && !profile.supports_cod {
            return Err(ServiceError::ValidationError(format!(
                "carrier '{}' does not support cash on delivery",
                carrier_code
            )));
        }
        if options.insurance_amount.is_some() && !profile.supports_insurance {
            return Err(ServiceError::ValidationError(format!(
                "carrier '{}' does not support insurance",
                carrier_code
            )));
        }

        let weight = order.total_weight_kg();
        if weight <= 0.0 {
            return Err(ServiceError::ValidationError(
                "order has no shippable items".to_string(),
            ));
        }

        // Serialize label creation per order: without this, two concurrent
        // requests both pass the active-slot check below before either row
        // exists, and the order is billed for two carrier labels.
        let order_lock = keyed_lock(&self.order_locks, order_id);
        let _order_guard = order_lock.lock().await;

        // One active shipment per order; a new label requires the previous
        // one to be cancelled, failed or returned. Also our de-duplication
        // guard: create_label at the carrier is billed, not idempotent.
        if self.store.has_active_shipment(order_id).await? {
            return Err(ServiceError::Conflict(format!(
                "order {} already has an active shipment",
                order_id
            )));
        }

        let receiver = Party {
            name: order.customer_name.clone(),
            phone: order.customer_phone.clone(),
            address: order.shipping_address.clone(),
            postal_code: order.postal_code.clone(),
        };

        let label = match connector
            .create_label(&order, &self.sender, &receiver, &options)
            .await
        {
            Ok(label) => label,
            Err(e) => {
                self.event_sender
                    .send(Event::ShipmentLabelFailed {
                        order_id,
                        carrier_code: carrier_code.to_string(),
                        reason: e.to_string(),
                    })
                    .await;
                return Err(e);
            }
        };

        let now = Utc::now();
        let active = shipment::ActiveModel {
            id: Set(Uuid::new_v4()),
            order_id: Set(order_id),
            carrier_code: Set(carrier_code.to_string()),
            tracking_number: Set(Some(label.tracking_number.clone())),
            status: Set(ShipmentStatus::Pending),
            sender_name: Set(self.sender.name.clone()),
            sender_phone: Set(self.sender.phone.clone()),
            sender_address: Set(self.sender.address.clone()),
            sender_postal_code: Set(self.sender.postal_code.clone()),
            recipient_name: Set(receiver.name),
            recipient_phone: Set(receiver.phone),
            recipient_address: Set(receiver.address),
            recipient_postal_code: Set(receiver.postal_code),
            shipping_cost: Set(Some(label.cost)),
            insurance_amount: Set(options.insurance_amount),
            weight_kg: Set(weight),
            dimensions_cm: Set(None),
            current_location: Set(None),
            tracking_events: Set(json!([])),
            label_url: Set(label.label_url),
            failure_reason: Set(None),
            estimated_delivery: Set(label.estimated_delivery),
            shipped_at: Set(None),
            delivered_at: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        };

        let created = match self.store.insert(active).await {
            Ok(model) => model,
            Err(e) => {
                warn!(
                    carrier = carrier_code,
                    tracking_number = %label.tracking_number,
                    "persisting shipment failed after label issuance, attempting carrier-side cancel"
                );
                if let Err(cancel_err) = connector.cancel_label(&label.tracking_number).await {
                    warn!(error = %cancel_err, "carrier-side label cancel failed");
                }
                return Err(e);
            }
        };

        self.store
            .set_order_tracking(order_id, Some(label.tracking_number.clone()))
            .await?;

        self.event_sender
            .send(Event::ShipmentCreated {
                shipment_id: created.id,
                order_id,
                carrier_code: carrier_code.to_string(),
                tracking_number: label.tracking_number,
            })
            .await;

        Ok(created)
    }

    /// Refreshes one shipment from its carrier and applies the canonical
    /// state-machine check. The single choke point the poller, the webhook
    /// path and manual refreshes all funnel through.
    #[instrument(skip(self))]
    pub async fn track_shipment(
        &self,
        tracking_number: &str,
        carrier: Option<&str>,
    ) -> Result<shipment::Model, ServiceError> {
        let shipment = self
            .store
            .find_by_tracking(tracking_number)
            .await?
            .ok_or_else(|| ServiceError::ShipmentNotFound(tracking_number.to_string()))?;

        let carrier_code = carrier.unwrap_or(shipment.carrier_code.as_str());
        let connector = self.registry.get(carrier_code)?;

        if shipment.status.is_terminal() {
            debug!(
                tracking_number,
                status = %shipment.status,
                "shipment already terminal, skipping refresh"
            );
            return Ok(shipment);
        }

        let data = connector.track(tracking_number).await?;

        // Serialize against concurrent writers (webhook vs poll) on this row,
        // then re-read so the transition check runs against fresh state.
        let lock = keyed_lock(&self.shipment_locks, shipment.id);
        let _guard = lock.lock().await;

        let current = self
            .store
            .find_by_tracking(tracking_number)
            .await?
            .ok_or_else(|| ServiceError::ShipmentNotFound(tracking_number.to_string()))?;

        if !current.status.can_transition_to(data.status) {
            if current.status != data.status {
                info!(
                    tracking_number,
                    current = %current.status,
                    reported = %data.status,
                    "discarding stale or out-of-order carrier report"
                );
            }
            return Ok(current);
        }

        let failure_reason = match data.status {
            ShipmentStatus::Failed | ShipmentStatus::Returned => Some(
                data.events
                    .last()
                    .map(|e| e.description.clone())
                    .unwrap_or_else(|| format!("carrier reported {}", data.status)),
            ),
            _ => None,
        };

        let update = StatusUpdate {
            new_status: data.status,
            current_location: data.current_location.clone(),
            tracking_events: Some(json!({
                "events": data.events,
                "raw": data.raw,
            })),
            estimated_delivery: data.estimated_delivery,
            failure_reason,
            set_shipped_at: !matches!(data.status, ShipmentStatus::Pending),
            set_delivered_at: data.status == ShipmentStatus::Delivered,
        };

        let applied = self.store.transition_status(&current, update).await?;
        if !applied {
            // A concurrent writer advanced the row between our read and the
            // conditional UPDATE; their state wins.
            debug!(tracking_number, "transition lost compare-and-set race");
            return self
                .store
                .find_by_tracking(tracking_number)
                .await?
                .ok_or_else(|| ServiceError::ShipmentNotFound(tracking_number.to_string()));
        }

        self.event_sender
            .send(Event::ShipmentStatusChanged {
                shipment_id: current.id,
                tracking_number: tracking_number.to_string(),
                old_status: current.status,
                new_status: data.status,
            })
            .await;

        if data.status == ShipmentStatus::Delivered {
            self.store.mark_order_delivered(current.order_id).await?;
            self.event_sender
                .send(Event::ShipmentDelivered {
                    shipment_id: current.id,
                    order_id: current.order_id,
                })
                .await;
        }

        // Terminal shipments are never written again; drop their lock entry
        // so the map does not grow for the life of the process. Late callers
        // re-read the row under a fresh lock and no-op on the terminal state.
        if data.status.is_terminal() {
            self.shipment_locks.remove(&current.id);
        }

        self.store
            .find_by_tracking(tracking_number)
            .await?
            .ok_or_else(|| ServiceError::ShipmentNotFound(tracking_number.to_string()))
    }

    /// Cancels a pending shipment. The pending check and the status write
    /// are one conditional UPDATE, so a racing pickup report cannot be
    /// overwritten.
    #[instrument(skip(self))]
    pub async fn cancel_shipment(
        &self,
        tracking_number: &str,
    ) -> Result<shipment::Model, ServiceError> {
        let shipment = self
            .store
            .find_by_tracking(tracking_number)
            .await?
            .ok_or_else(|| ServiceError::ShipmentNotFound(tracking_number.to_string()))?;

        if shipment.status != ShipmentStatus::Pending {
            return Err(ServiceError::InvalidStateTransition(
                "only pending shipments can be cancelled".to_string(),
            ));
        }

        let connector = self.registry.get(&shipment.carrier_code)?;
        let confirmed = connector.cancel_label(tracking_number).await?;
        if !confirmed {
            return Err(ServiceError::InvalidStateTransition(
                "carrier rejected the cancellation; the parcel has likely shipped".to_string(),
            ));
        }

        let cancelled = self.store.cancel_if_pending(shipment.id).await?;
        if !cancelled {
            return Err(ServiceError::InvalidStateTransition(
                "only pending shipments can be cancelled".to_string(),
            ));
        }

        self.shipment_locks.remove(&shipment.id);
        self.store
            .set_order_tracking(shipment.order_id, None)
            .await?;
        self.event_sender
            .send(Event::ShipmentCancelled {
                shipment_id: shipment.id,
                order_id: shipment.order_id,
            })
            .await;

        self.store
            .find_by_tracking(tracking_number)
            .await?
            .ok_or_else(|| ServiceError::ShipmentNotFound(tracking_number.to_string()))
    }

    /// Refreshes every non-terminal shipment with bounded concurrency.
    /// Individual failures are logged and counted, never aborting the sweep.
    #[instrument(skip(self))]
    pub async fn update_all_tracking(&self) -> Result<TrackingSweepSummary, ServiceError> {
        let shipments = self.store.list_non_terminal().await?;
        let total = shipments.len();

        let results: Vec<Result<bool, (String, ServiceError)>> = stream::iter(shipments)
            .map(|shipment| {
                let service = self.clone();
                async move {
                    let Some(tracking_number) = shipment.tracking_number.clone() else {
                        // Rows without a tracking number should not exist;
                        // there is nothing to refresh them against.
                        warn!(shipment_id = %shipment.id, "non-terminal shipment without tracking number");
                        return Ok(false);
                    };
                    service
                        .track_shipment(&tracking_number, None)
                        .await
                        .map(|_| true)
                        .map_err(|e| (tracking_number, e))
                }
            })
            .buffer_unordered(self.tracking_concurrency)
            .collect()
            .await;

        let mut summary = TrackingSweepSummary {
            total,
            ..Default::default()
        };
        for result in results {
            match result {
                Ok(true) => summary.refreshed += 1,
                Ok(false) => summary.skipped += 1,
                Err((tracking_number, e)) => {
                    warn!(%tracking_number, error = %e, "tracking refresh failed");
                    summary.failed += 1;
                }
            }
        }

        self.event_sender
            .send(Event::TrackingSweepCompleted {
                total: summary.total,
                refreshed: summary.refreshed,
                failed: summary.failed,
                skipped: summary.skipped,
            })
            .await;

        Ok(summary)
    }

    /// Ingests one inbound carrier webhook. Returns whether the payload was
    /// matched and applied; every other outcome is logged and swallowed so
    /// the HTTP layer can always acknowledge.
    #[instrument(skip(self, body, signature))]
    pub async fn handle_carrier_webhook(
        &self,
        carrier_code: &str,
        body: &[u8],
        signature: Option<&str>,
    ) -> Result<bool, ServiceError> {
        let connector = self.registry.get(carrier_code)?;

        if let Some(secret) = connector.webhook_secret() {
            let valid = signature
                .map(|sig| signature_valid(secret, body, sig))
                .unwrap_or(false);
            if !valid {
                warn!(carrier = carrier_code, "webhook signature missing or invalid");
                return Ok(false);
            }
        }

        let Some(event) = connector.parse_webhook(body) else {
            warn!(carrier = carrier_code, "unparseable webhook payload");
            return Ok(false);
        };

        if self
            .store
            .find_by_tracking(&event.tracking_number)
            .await?
            .is_none()
        {
            warn!(
                carrier = carrier_code,
                tracking_number = %event.tracking_number,
                "webhook for unknown shipment"
            );
            return Ok(false);
        }

        // Fast-path refresh: the webhook tells us something changed, the
        // carrier's tracking API is the source of truth for what.
        match self
            .track_shipment(&event.tracking_number, Some(carrier_code))
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => {
                warn!(
                    carrier = carrier_code,
                    tracking_number = %event.tracking_number,
                    error = %e,
                    "webhook-triggered refresh failed"
                );
                Ok(false)
            }
        }
    }

    /// All shipments for an order, most recent first.
    pub async fn get_shipping_history(
        &self,
        order_id: Uuid,
    ) -> Result<Vec<shipment::Model>, ServiceError> {
        self.store.find_for_order(order_id).await
    }

    /// Creates labels for a batch of orders, one at a time (label creation
    /// is carrier-billed and not idempotent). One bad order never fails the
    /// batch.
    #[instrument(skip(self, order_ids))]
    pub async fn create_labels_bulk(
        &self,
        order_ids: Vec<Uuid>,
        carrier_code: &str,
    ) -> Result<BulkLabelResult, ServiceError> {
        // Reject unknown carriers up front rather than once per order.
        self.registry.get(carrier_code)?;

        let mut results = Vec::with_capacity(order_ids.len());
        for order_id in order_ids {
            match self
                .create_label(order_id, carrier_code, LabelOptions::default())
                .await
            {
                Ok(shipment) => results.push(BulkLabelEntry {
                    order_id,
                    success: true,
                    tracking_number: shipment.tracking_number,
                    error: None,
                }),
                Err(e) => results.push(BulkLabelEntry {
                    order_id,
                    success: false,
                    tracking_number: None,
                    error: Some(e.to_string()),
                }),
            }
        }

        let succeeded = results.iter().filter(|r| r.success).count();
        let failed = results.len() - succeeded;
        Ok(BulkLabelResult {
            total: results.len(),
            succeeded,
            failed,
            results,
        })
    }

    /// Shipment counts and average cost grouped by carrier and by status.
    #[instrument(skip(self))]
    pub async fn shipping_stats(
        &self,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<ShippingStats, ServiceError> {
        let shipments = self.store.list_created_between(from, to).await?;

        let mut by_carrier: BTreeMap<String, (usize, Decimal, usize)> = BTreeMap::new();
        let mut by_status: BTreeMap<String, (ShipmentStatus, usize)> = BTreeMap::new();

        for shipment in &shipments {
            let carrier = by_carrier
                .entry(shipment.carrier_code.clone())
                .or_insert((0, Decimal::ZERO, 0));
            carrier.0 += 1;
            if let Some(cost) = shipment.shipping_cost {
                carrier.1 += cost;
                carrier.2 += 1;
            }

            by_status
                .entry(shipment.status.to_string())
                .or_insert((shipment.status, 0))
                .1 += 1;
        }

        Ok(ShippingStats {
            total: shipments.len(),
            by_carrier: by_carrier
                .into_iter()
                .map(|(carrier_code, (count, cost_sum, costed))| CarrierStats {
                    carrier_code,
                    count,
                    avg_cost: (costed > 0).then(|| cost_sum / Decimal::from(costed)),
                })
                .collect(),
            by_status: by_status
                .into_values()
                .map(|(status, count)| StatusCount { status, count })
                .collect(),
        })
    }
}

/// Constant-time HMAC-SHA256 verification of a hex-encoded signature.
fn signature_valid(secret: &str, body: &[u8], provided: &str) -> bool {
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    match hex::decode(provided.trim()) {
        Ok(signature) => mac.verify_slice(&signature).is_ok(),
        Err(_) => false,
    }
}
