use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::models::shipment::ShipmentStatus;

/// Domain events emitted by the shipping orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    ShipmentCreated {
        shipment_id: Uuid,
        order_id: Uuid,
        carrier_code: String,
        tracking_number: String,
    },
    ShipmentStatusChanged {
        shipment_id: Uuid,
        tracking_number: String,
        old_status: ShipmentStatus,
        new_status: ShipmentStatus,
    },
    ShipmentDelivered {
        shipment_id: Uuid,
        order_id: Uuid,
    },
    ShipmentCancelled {
        shipment_id: Uuid,
        order_id: Uuid,
    },
    ShipmentLabelFailed {
        order_id: Uuid,
        carrier_code: String,
        reason: String,
    },
    TrackingSweepCompleted {
        total: usize,
        refreshed: usize,
        failed: usize,
        skipped: usize,
    },
}

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event; a full or closed channel is logged, never propagated,
    /// so event delivery can never fail a shipping operation.
    pub async fn send(&self, event: Event) {
        if let Err(e) = self.sender.send(event).await {
            warn!("Failed to send event: {}", e);
        }
    }
}

/// Consumes the event stream. For now events are surfaced as structured
/// logs; downstream integrations subscribe here.
pub async fn process_events(mut rx: mpsc::Receiver<Event>) {
    info!("Starting event processing loop");
    while let Some(event) = rx.recv().await {
        match &event {
            Event::ShipmentDelivered {
                shipment_id,
                order_id,
            } => {
                info!(%shipment_id, %order_id, "shipment delivered");
            }
            Event::ShipmentLabelFailed {
                order_id,
                carrier_code,
                reason,
            } => {
                warn!(%order_id, carrier = %carrier_code, %reason, "label creation failed");
            }
            other => {
                info!(event = ?other, "shipping event");
            }
        }
    }
    info!("Event processing loop stopped");
}
