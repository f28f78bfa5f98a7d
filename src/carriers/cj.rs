use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDateTime, Utc};
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

/// CJ Logistics connector.
///
/// CJ reports tracking milestones as two-digit numeric state codes and
/// timestamps in KST without an offset.
pub struct CjConnector {
    profile: carrier::Model,
    settings: Option<CarrierSettings>,
    client: reqwest::Client,
}

impl CjConnector {
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

    /// CJ state codes into the canonical vocabulary.
    fn map_status(code: &str) -> Option<ShipmentStatus> {
        match code {
            "11" => Some(ShipmentStatus::PickedUp),
            "21" | "41" | "42" => Some(ShipmentStatus::InTransit),
            "82" => Some(ShipmentStatus::OutForDelivery),
            "91" => Some(ShipmentStatus::Delivered),
            "71" => Some(ShipmentStatus::Failed),
            "95" => Some(ShipmentStatus::Returned),
            _ => None,
        }
    }

    /// CJ timestamps are KST ("YYYY-MM-DD HH:MM:SS", no offset).
    fn parse_kst(raw: &str) -> Option<DateTime<Utc>> {
        let kst = FixedOffset::east_opt(9 * 3600)?;
        NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
            .ok()?
            .and_local_timezone(kst)
            .single()
            .map(|dt| dt.with_timezone(&Utc))
    }

    fn rate_for(&self, weight_kg: f32, destination_postal: &str) -> Decimal {
        let kg = Decimal::from(billable_kg(weight_kg));
        let raw = self.profile.base_rate
            + self.profile.per_kg_rate * kg
            + self.profile.region_surcharge(destination_postal);
        // CJ tariffs are quoted in 100 KRW steps.
        let hundred = Decimal::from(100);
        (raw / hundred).ceil() * hundred
    }
}

#[derive(Debug, Deserialize)]
struct CjLabelResponse {
    #[serde(rename = "invcNo")]
    invc_no: String,
    #[serde(rename = "labelUrl")]
    label_url: Option<String>,
    #[serde(rename = "dlvdDate")]
    dlvd_date: Option<String>,
    fare: Decimal,
}

#[derive(Debug, Deserialize)]
struct CjScan {
    #[serde(rename = "scanDt")]
    scan_dt: String,
    #[serde(rename = "statCd")]
    stat_cd: String,
    #[serde(rename = "branNm")]
    bran_nm: Option<String>,
    #[serde(rename = "crgStDnm")]
    crg_st_dnm: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CjTrackingResponse {
    #[serde(rename = "statCd")]
    stat_cd: String,
    #[serde(rename = "branNm")]
    bran_nm: Option<String>,
    #[serde(rename = "dlvdDate")]
    dlvd_date: Option<String>,
    #[serde(rename = "scanList", default)]
    scan_list: Vec<CjScan>,
}

#[derive(Debug, Deserialize)]
struct CjWebhookPayload {
    invc_no: String,
    stat_cd: String,
    bran_nm: Option<String>,
    event_dt: Option<String>,
}

#[async_trait]
impl CarrierConnector for CjConnector {
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
            debug!(carrier = "cj", "not configured, quoting unavailable");
            return Ok(None);
        }
        let remote = self.profile.region_surcharge(destination_postal) > Decimal::ZERO;
        Ok(Some(RateQuote {
            carrier_code: self.profile.code.clone(),
            carrier_name: self.profile.name.clone(),
            service_name: "CJ Standard".to_string(),
            cost: self.rate_for(weight_kg, destination_postal),
            estimated_days: if remote { 2 } else { 1 },
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
            ServiceError::CarrierApiError("CJ Logistics is not configured".to_string())
        })?;

        let body = json!({
            "custCd": settings.account_code,
            "orderNo": order.order_number,
            "sender": {
                "nm": sender.name,
                "tel": sender.phone,
                "addr": sender.address,
                "zip": sender.postal_code,
            },
            "receiver": {
                "nm": receiver.name,
                "tel": receiver.phone,
                "addr": receiver.address,
                "zip": receiver.postal_code,
            },
            "items": order.parsed_items(),
            "cod": options.cod,
            "insrAmt": options.insurance_amount,
        });

        let response = self
            .client
            .post(format!("{}/v1/labels", settings.endpoint))
            .header("CJ-Api-Key", &settings.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| ServiceError::CarrierApiError(format!("CJ label request: {}", e)))?;

        if !response.status().is_success() {
            return Err(ServiceError::CarrierApiError(format!(
                "CJ label request returned {}",
                response.status()
            )));
        }

        let label: CjLabelResponse = response
            .json()
            .await
            .map_err(|e| ServiceError::CarrierApiError(format!("CJ label response: {}", e)))?;

        Ok(LabelData {
            tracking_number: label.invc_no,
            label_url: label.label_url,
            estimated_delivery: label.dlvd_date.as_deref().and_then(Self::parse_kst),
            cost: label.fare,
        })
    }

    async fn track(&self, tracking_number: &str) -> Result<TrackingData, ServiceError> {
        let settings = self.configured().ok_or_else(|| {
            ServiceError::CarrierApiError("CJ Logistics is not configured".to_string())
        })?;

        let response = self
            .client
            .get(format!(
                "{}/v1/tracking/{}",
                settings.endpoint, tracking_number
            ))
            .header("CJ-Api-Key", &settings.api_key)
            .send()
            .await
            .map_err(|e| ServiceError::CarrierApiError(format!("CJ tracking request: {}", e)))?;

        if !response.status().is_success() {
            return Err(ServiceError::CarrierApiError(format!(
                "CJ tracking request returned {}",
                response.status()
            )));
        }

        let raw: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ServiceError::CarrierApiError(format!("CJ tracking response: {}", e)))?;
        let parsed: CjTrackingResponse = serde_json::from_value(raw.clone())
            .map_err(|e| ServiceError::CarrierApiError(format!("CJ tracking payload: {}", e)))?;

        let status = Self::map_status(&parsed.stat_cd).ok_or_else(|| {
            ServiceError::CarrierApiError(format!("CJ reported unknown state code {}", parsed.stat_cd))
        })?;

        let events = parsed
            .scan_list
            .iter()
            .filter_map(|scan| {
                let status = Self::map_status(&scan.stat_cd)?;
                Some(TrackingEvent {
                    timestamp: Self::parse_kst(&scan.scan_dt)?,
                    status,
                    location: scan.bran_nm.clone(),
                    description: scan
                        .crg_st_dnm
                        .clone()
                        .unwrap_or_else(|| scan.stat_cd.clone()),
                })
            })
            .collect();

        Ok(TrackingData {
            status,
            current_location: parsed.bran_nm,
            estimated_delivery: parsed.dlvd_date.as_deref().and_then(Self::parse_kst),
            events,
            raw,
        })
    }

    async fn cancel_label(&self, tracking_number: &str) -> Result<bool, ServiceError> {
        let settings = self.configured().ok_or_else(|| {
            ServiceError::CarrierApiError("CJ Logistics is not configured".to_string())
        })?;

        let response = self
            .client
            .post(format!(
                "{}/v1/labels/{}/cancel",
                settings.endpoint, tracking_number
            ))
            .header("CJ-Api-Key", &settings.api_key)
            .send()
            .await
            .map_err(|e| ServiceError::CarrierApiError(format!("CJ cancel request: {}", e)))?;

        let status = response.status();
        if status.is_success() {
            Ok(true)
        } else if status.is_client_error() {
            // Carrier refused (typically already picked up). Best-effort.
            Ok(false)
        } else {
            Err(ServiceError::CarrierApiError(format!(
                "CJ cancel request returned {}",
                status
            )))
        }
    }

    fn parse_webhook(&self, payload: &[u8]) -> Option<WebhookEvent> {
        let parsed: CjWebhookPayload = serde_json::from_slice(payload).ok()?;
        let status = Self::map_status(&parsed.stat_cd)?;
        Some(WebhookEvent {
            tracking_number: parsed.invc_no,
            status,
            location: parsed.bran_nm,
            timestamp: parsed.event_dt.as_deref().and_then(Self::parse_kst),
        })
    }
}
