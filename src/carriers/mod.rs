use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;
use utoipa::ToSchema;

use crate::config::CarrierSettings;
use crate::errors::ServiceError;
use crate::models::carrier;
use crate::models::order::{self, OrderItem};
use crate::models::shipment::ShipmentStatus;

pub mod cj;
pub mod hanjin;
pub mod lotte;

/// One party on a label: the merchant sender or the parcel recipient.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Party {
    pub name: String,
    pub phone: Option<String>,
    pub address: String,
    pub postal_code: String,
}

/// Caller-selected label options.
#[derive(Debug, Clone, Default)]
pub struct LabelOptions {
    pub cod: bool,
    pub insurance_amount: Option<Decimal>,
}

/// A single carrier's answer during rate shopping.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct RateQuote {
    #[schema(example = "cj")]
    pub carrier_code: String,
    #[schema(example = "CJ Logistics")]
    pub carrier_name: String,
    #[schema(example = "CJ Standard")]
    pub service_name: String,
    /// Estimated cost in KRW.
    #[schema(example = 3800)]
    pub cost: Decimal,
    #[schema(example = 2)]
    pub estimated_days: u32,
    #[serde(skip)]
    pub priority: i32,
}

/// Successful label issuance.
#[derive(Debug, Clone)]
pub struct LabelData {
    pub tracking_number: String,
    pub label_url: Option<String>,
    pub estimated_delivery: Option<DateTime<Utc>>,
    pub cost: Decimal,
}

/// One timestamped carrier-reported milestone, already normalized.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TrackingEvent {
    pub timestamp: DateTime<Utc>,
    pub status: ShipmentStatus,
    pub location: Option<String>,
    pub description: String,
}

/// Normalized tracking snapshot. Connectors translate carrier-native status
/// vocabularies before returning; the orchestrator never sees raw statuses.
#[derive(Debug, Clone)]
pub struct TrackingData {
    pub status: ShipmentStatus,
    pub current_location: Option<String>,
    pub estimated_delivery: Option<DateTime<Utc>>,
    pub events: Vec<TrackingEvent>,
    /// Untouched carrier payload, persisted for audit only.
    pub raw: serde_json::Value,
}

/// Normalized view of an inbound carrier webhook.
#[derive(Debug, Clone)]
pub struct WebhookEvent {
    pub tracking_number: String,
    pub status: ShipmentStatus,
    pub location: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
}

/// Adapter implementing one carrier's API in the canonical interface.
///
/// Failure contract: `quote` degrades to `Ok(None)` for an unreachable or
/// unconfigured carrier, `cancel_label` returns `Ok(false)` on carrier
/// rejection, and `parse_webhook` returns `None` for payloads it does not
/// recognize. Only `create_label` and `track` surface `CarrierApiError`.
#[async_trait]
pub trait CarrierConnector: Send + Sync {
    /// The carrier configuration row this connector was built from.
    fn profile(&self) -> &carrier::Model;

    fn code(&self) -> &str {
        self.profile().code.as_str()
    }

    /// Secret used to verify inbound webhook signatures, when configured.
    fn webhook_secret(&self) -> Option<&str>;

    async fn quote(
        &self,
        weight_kg: f32,
        destination_postal: &str,
        items: &[OrderItem],
    ) -> Result<Option<RateQuote>, ServiceError>;

    async fn create_label(
        &self,
        order: &order::Model,
        sender: &Party,
        receiver: &Party,
        options: &LabelOptions,
    ) -> Result<LabelData, ServiceError>;

    async fn track(&self, tracking_number: &str) -> Result<TrackingData, ServiceError>;

    async fn cancel_label(&self, tracking_number: &str) -> Result<bool, ServiceError>;

    fn parse_webhook(&self, payload: &[u8]) -> Option<WebhookEvent>;
}

/// Billable weight: carriers round fractional kilograms up.
pub(crate) fn billable_kg(weight_kg: f32) -> u32 {
    weight_kg.ceil().max(1.0) as u32
}

/// Lookup table from carrier code to connector, populated once at startup.
/// The single place that knows which carriers exist.
pub struct CarrierRegistry {
    connectors: HashMap<String, Arc<dyn CarrierConnector>>,
}

impl CarrierRegistry {
    pub fn new() -> Self {
        Self {
            connectors: HashMap::new(),
        }
    }

    pub fn register(&mut self, connector: Arc<dyn CarrierConnector>) {
        self.connectors
            .insert(connector.code().to_string(), connector);
    }

    pub fn get(&self, code: &str) -> Result<Arc<dyn CarrierConnector>, ServiceError> {
        self.connectors
            .get(code)
            .cloned()
            .ok_or_else(|| ServiceError::CarrierNotSupported(code.to_string()))
    }

    pub fn connectors(&self) -> impl Iterator<Item = &Arc<dyn CarrierConnector>> {
        self.connectors.values()
    }

    pub fn codes(&self) -> Vec<String> {
        self.connectors.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.connectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connectors.is_empty()
    }

    /// Builds the registry from carrier configuration rows plus per-carrier
    /// credentials. Inactive rows and rows with an unrecognized code are
    /// skipped with a warning; missing credentials are fine (that carrier
    /// simply quotes as unavailable).
    pub fn build(
        profiles: Vec<carrier::Model>,
        settings: &HashMap<String, CarrierSettings>,
        client: reqwest::Client,
    ) -> Self {
        let mut registry = Self::new();
        for profile in profiles {
            if !profile.active {
                continue;
            }
            let creds = settings.get(&profile.code).cloned();
            let connector: Arc<dyn CarrierConnector> = match profile.code.as_str() {
                "cj" => Arc::new(cj::CjConnector::new(profile, creds, client.clone())),
                "hanjin" => Arc::new(hanjin::HanjinConnector::new(profile, creds, client.clone())),
                "lotte" => Arc::new(lotte::LotteConnector::new(profile, creds, client.clone())),
                other => {
                    warn!(carrier = other, "no connector implemented for carrier, skipping");
                    continue;
                }
            };
            registry.register(connector);
        }
        registry
    }
}

impl Default for CarrierRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn billable_weight_rounds_up_with_one_kg_floor() {
        assert_eq!(billable_kg(0.2), 1);
        assert_eq!(billable_kg(1.0), 1);
        assert_eq!(billable_kg(1.01), 2);
        assert_eq!(billable_kg(4.4), 5);
    }
}
