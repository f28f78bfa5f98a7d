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

/// Lotte Global Logistics connector.
///
/// Lotte reports milestone names in Korean and nests webhook events under an
/// `event` object.
pub struct LotteConnector {
    profile: carrier::Model,
    settings: Option<CarrierSettings>,
    client: reqwest::Client,
}

impl LotteConnector {
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

    fn map_status(name: &str) -> Option<ShipmentStatus> {
        match name {
            "집화완료" => Some(ShipmentStatus::PickedUp),
            "간선상차" | "간선하차" | "배송입고" => Some(ShipmentStatus::InTransit),
            "배송출발" => Some(ShipmentStatus::OutForDelivery),
            "배송완료" => Some(ShipmentStatus::Delivered),
            "배송불가" => Some(ShipmentStatus::Failed),
            "반품" => Some(ShipmentStatus::Returned),
            _ => None,
        }
    }

    fn rate_for(&self, weight_kg: f32, destination_postal: &str) -> Decimal {
        let kg = Decimal::from(billable_kg(weight_kg));
        let raw = self.profile.base_rate
            + self.profile.per_kg_rate * kg
            + self.profile.region_surcharge(destination_postal);
        // Lotte tariffs are quoted in 10 KRW steps.
        let ten = Decimal::from(10);
        (raw / ten).ceil() * ten
    }
}

#[derive(Debug, Deserialize)]
struct LotteLabelResponse {
    tracking_number: String,
    label_url: Option<String>,
    eta: Option<DateTime<Utc>>,
    amount: Decimal,
}

#[derive(Debug, Deserialize)]
struct LotteEvent {
    code: String,
    location: Option<String>,
    occurred_at: DateTime<Utc>,
    #[serde(default)]
    detail: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LotteTrackingResponse {
    status: String,
    location: Option<String>,
    eta: Option<DateTime<Utc>>,
    #[serde(default)]
    history: Vec<LotteEvent>,
}

#[derive(Debug, Deserialize)]
struct LotteWebhookPayload {
    tracking_number: String,
    event: LotteEvent,
}

#[async_trait]
impl CarrierConnector for LotteConnector {
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
            debug!(carrier = "lotte", "not configured, quoting unavailable");
            return Ok(None);
        }
        let remote = self.profile.region_surcharge(destination_postal) > Decimal::ZERO;
        Ok(Some(RateQuote {
            carrier_code: self.profile.code.clone(),
            carrier_name: self.profile.name.clone(),
            service_name: "Lotte Parcel".to_string(),
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
            ServiceError::CarrierApiError("Lotte Global Logistics is not configured".to_string())
        })?;

        let body = json!({
            "account": settings.account_code,
            "order_number": order.order_number,
            "sender": sender,
            "receiver": receiver,
            "items": order.parsed_items(),
            "cod": options.cod,
            "insurance": options.insurance_amount,
        });

        let response = self
            .client
            .post(format!("{}/parcel/v2/labels", settings.endpoint))
            .header("X-Lotte-Api-Key", &settings.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| ServiceError::CarrierApiError(format!("Lotte label request: {}", e)))?;

        if !response.status().is_success() {
            return Err(ServiceError::CarrierApiError(format!(
                "Lotte label request returned {}",
                response.status()
            )));
        }

        let label: LotteLabelResponse = response
            .json()
            .await
            .map_err(|e| ServiceError::CarrierApiError(format!("Lotte label response: {}", e)))?;

        Ok(LabelData {
            tracking_number: label.tracking_number,
            label_url: label.label_url,
            estimated_delivery: label.eta,
            cost: label.amount,
        })
    }

    async fn track(&self, tracking_number: &str) -> Result<TrackingData, ServiceError> {
        let settings = self.configured().ok_or_else(|| {
            ServiceError::CarrierApiError("Lotte Global Logistics is not configured".to_string())
        })?;

        let response = self
            .client
            .get(format!(
                "{}/parcel/v2/tracking/{}",
                settings.endpoint, tracking_number
            ))
            .header("X-Lotte-Api-Key", &settings.api_key)
            .send()
            .await
            .map_err(|e| ServiceError::CarrierApiError(format!("Lotte tracking request: {}", e)))?;

        if !response.status().is_success() {
            return Err(ServiceError::CarrierApiError(format!(
                "Lotte tracking request returned {}",
                response.status()
            )));
        }

        let raw: serde_json::Value = response.json().await.map_err(|e| {
            ServiceError::CarrierApiError(format!("Lotte tracking response: {}", e))
        })?;
        let parsed: LotteTrackingResponse = serde_json::from_value(raw.clone())
            .map_err(|e| ServiceError::CarrierApiError(format!("Lotte tracking payload: {}", e)))?;

        let status = Self::map_status(&parsed.status).ok_or_else(|| {
            ServiceError::CarrierApiError(format!(
                "Lotte reported unknown status '{}'",
                parsed.status
            ))
        })?;

        let events = parsed
            .history
            .iter()
            .filter_map(|event| {
                let status = Self::map_status(&event.code)?;
                Some(TrackingEvent {
                    timestamp: event.occurred_at,
                    status,
                    location: event.location.clone(),
                    description: event.detail.clone().unwrap_or_else(|| event.code.clone()),
                })
            })
            .collect();

        Ok(TrackingData {
            status,
            current_location: parsed.location,
            estimated_delivery: parsed.eta,
            events,
            raw,
        })
    }

    async fn cancel_label(&self, tracking_number: &str) -> Result<bool, ServiceError> {
        let settings = self.configured().ok_or_else(|| {
            ServiceError::CarrierApiError("Lotte Global Logistics is not configured".to_string())
        })?;

        let response = self
            .client
            .post(format!(
                "{}/parcel/v2/labels/{}/cancel",
                settings.endpoint, tracking_number
            ))
            .header("X-Lotte-Api-Key", &settings.api_key)
            .send()
            .await
            .map_err(|e| ServiceError::CarrierApiError(format!("Lotte cancel request: {}", e)))?;

        let status = response.status();
        if status.is_success() {
            Ok(true)
        } else if status.is_client_error() {
            Ok(false)
        } else {
            Err(ServiceError::CarrierApiError(format!(
                "Lotte cancel request returned {}",
                status
            )))
        }
    }

    fn parse_webhook(&self, payload: &[u8]) -> Option<WebhookEvent> {
        let parsed: LotteWebhookPayload = serde_json::from_slice(payload).ok()?;
        let status = Self::map_status(&parsed.event.code)?;
        Some(WebhookEvent {
            tracking_number: parsed.tracking_number,
            status,
            location: parsed.event.location,
            timestamp: Some(parsed.event.occurred_at),
        })
    }
}
