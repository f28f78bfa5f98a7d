use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use super::{
    billable_kg, CarrierConnector, LabelData, LabelOptions, Party, RateQuote, TrackingData,
    TrackingEvent, WebhookEvent,
};
use crate::config::CarrierSettings;
use crate::errors::ServiceError;
use crate::models::carrier;
use crate::models::order::{self, OrderItem};
use crate::models::shipment::ShipmentStatus;

/// Hanjin Express connector.
///
/// Hanjin uses upper-snake textual status codes and RFC 3339 timestamps.
/// The first kilogram is included in the base rate.
pub struct HanjinConnector {
    profile: carrier::Model,
    settings: Option<CarrierSettings>,
    client: reqwest::Client,
}

impl HanjinConnector {
    pub fn new(
        profile: carrier::Model,
        settings: Option<CarrierSettings>,
        client: reqwest::Client,
    ) -> Self {
        Self {
            profile,
            settings,
            client,
        }
    }

    fn configured(&self) -> Option<&CarrierSettings> {
        self.settings.as_ref().filter(|s| !s.api_key.is_empty())
    }

    fn map_status(code: &str) -> Option<ShipmentStatus> {
        match code {
            "RECEIVED" => Some(ShipmentStatus::PickedUp),
            "AT_HUB" | "IN_TRANSIT" => Some(ShipmentStatus::InTransit),
            "OUT_FOR_DELIVERY" => Some(ShipmentStatus::OutForDelivery),
            "DELIVERED" => Some(ShipmentStatus::Delivered),
            "DELIVERY_FAILED" => Some(ShipmentStatus::Failed),
            "RETURNED" => Some(ShipmentStatus::Returned),
            _ => None,
        }
    }

    fn rate_for(&self, weight_kg: f32, destination_postal: &str) -> Decimal {
        // Base covers the first kg; each additional billed kg is extra.
        let extra_kg = Decimal::from(billable_kg(weight_kg).saturating_sub(1));
        self.profile.base_rate
            + self.profile.per_kg_rate * extra_kg
            + self.profile.region_surcharge(destination_postal)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HanjinLabelResponse {
    tracking_no: String,
    label_url: Option<String>,
    estimated_delivery: Option<DateTime<Utc>>,
    charge: Decimal,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HanjinScan {
    occurred_at: DateTime<Utc>,
    status: String,
    branch: Option<String>,
    #[serde(default)]
    remark: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HanjinTrackingResponse {
    status: String,
    branch: Option<String>,
    estimated_delivery: Option<DateTime<Utc>>,
    #[serde(default)]
    scans: Vec<HanjinScan>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HanjinWebhookPayload {
    tracking_no: String,
    status: String,
    branch: Option<String>,
    occurred_at: Option<DateTime<Utc>>,
}

#[async_trait]
impl CarrierConnector for HanjinConnector {
    fn profile(&self) -> &carrier::Model {
        &self.profile
    }

    fn webhook_secret(&self) -> Option<&str> {
        self.settings
            .as_ref()
            .and_then(|s| s.webhook_secret.as_deref())
    }

    async fn quote(
        &self,
        weight_kg: f32,
        destination_postal: &str,
        _items: &[OrderItem],
    ) -> Result<Option<RateQuote>, ServiceError> {
        if self.configured().is_none() {
            debug!(carrier = "hanjin", "not configured, quoting unavailable");
            return Ok(None);
        }
        let remote = self.profile.region_surcharge(destination_postal) > Decimal::ZERO;
        Ok(Some(RateQuote {
            carrier_code: self.profile.code.clone(),
            carrier_name: self.profile.name.clone(),
            service_name: "Hanjin Express".to_string(),
            cost: self.rate_for(weight_kg, destination_postal),
            estimated_days: if remote { 3 } else { 2 },
            priority: self.profile.priority,
        }))
    }

    async fn create_label(
        &self,
        order: &order::Model,
        sender: &Party,
        receiver: &Party,
        options: &LabelOptions,
    ) -> Result<LabelData, ServiceError> {
        let settings = self.configured().ok_or_else(|| {
            ServiceError::CarrierApiError("Hanjin Express is not configured".to_string())
        })?;

        let body = json!({
            "accountCode": settings.account_code,
            "orderNumber": order.order_number,
            "sender": sender,
            "receiver": receiver,
            "items": order.parsed_items(),
            "cashOnDelivery": options.cod,
            "insuranceAmount": options.insurance_amount,
        });

        let response = self
            .client
            .post(format!("{}/api/labels", settings.endpoint))
            .bearer_auth(&settings.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| ServiceError::CarrierApiError(format!("Hanjin label request: {}", e)))?;

        if !response.status().is_success() {
            return Err(ServiceError::CarrierApiError(format!(
                "Hanjin label request returned {}",
                response.status()
            )));
        }

        let label: HanjinLabelResponse = response
            .json()
            .await
            .map_err(|e| ServiceError::CarrierApiError(format!("Hanjin label response: {}", e)))?;

        Ok(LabelData {
            tracking_number: label.tracking_no,
            label_url: label.label_url,
            estimated_delivery: label.estimated_delivery,
            cost: label.charge,
        })
    }

    async fn track(&self, tracking_number: &str) -> Result<TrackingData, ServiceError> {
        let settings = self.configured().ok_or_else(|| {
            ServiceError::CarrierApiError("Hanjin Express is not configured".to_string())
        })?;

        let response = self
            .client
            .get(format!(
                "{}/api/tracking/{}",
                settings.endpoint, tracking_number
            ))
            .bearer_auth(&settings.api_key)
            .send()
            .await
            .map_err(|e| {
                ServiceError::CarrierApiError(format!("Hanjin tracking request: {}", e))
            })?;

        if !response.status().is_success() {
            return Err(ServiceError::CarrierApiError(format!(
                "Hanjin tracking request returned {}",
                response.status()
            )));
        }

        let raw: serde_json::Value = response.json().await.map_err(|e| {
            ServiceError::CarrierApiError(format!("Hanjin tracking response: {}", e))
        })?;
        let parsed: HanjinTrackingResponse = serde_json::from_value(raw.clone()).map_err(|e| {
            ServiceError::CarrierApiError(format!("Hanjin tracking payload: {}", e))
        })?;

        let status = Self::map_status(&parsed.status).ok_or_else(|| {
            ServiceError::CarrierApiError(format!(
                "Hanjin reported unknown status '{}'",
                parsed.status
            ))
        })?;

        let events = parsed
            .scans
            .iter()
            .filter_map(|scan| {
                let status = Self::map_status(&scan.status)?;
                Some(TrackingEvent {
                    timestamp: scan.occurred_at,
                    status,
                    location: scan.branch.clone(),
                    description: scan.remark.clone().unwrap_or_else(|| scan.status.clone()),
                })
            })
            .collect();

        Ok(TrackingData {
            status,
            current_location: parsed.branch,
            estimated_delivery: parsed.estimated_delivery,
            events,
            raw,
        })
    }

    async fn cancel_label(&self, tracking_number: &str) -> Result<bool, ServiceError> {
        let settings = self.configured().ok_or_else(|| {
            ServiceError::CarrierApiError("Hanjin Express is not configured".to_string())
        })?;

        let response = self
            .client
            .delete(format!(
                "{}/api/labels/{}",
                settings.endpoint, tracking_number
            ))
            .bearer_auth(&settings.api_key)
            .send()
            .await
            .map_err(|e| ServiceError::CarrierApiError(format!("Hanjin cancel request: {}", e)))?;

        let status = response.status();
        if status.is_success() {
            Ok(true)
        } else if status.is_client_error() {
            Ok(false)
        } else {
            Err(ServiceError::CarrierApiError(format!(
                "Hanjin cancel request returned {}",
                status
            )))
        }
    }

    fn parse_webhook(&self, payload: &[u8]) -> Option<WebhookEvent> {
        let parsed: HanjinWebhookPayload = serde_json::from_slice(payload).ok()?;
        let status = Self::map_status(&parsed.status)?;
        Some(WebhookEvent {
            tracking_number: parsed.tracking_no,
            status,
            location: parsed.branch,
            timestamp: parsed.occurred_at,
        })
    }
}
