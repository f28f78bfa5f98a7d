use crate::{
    carriers::{LabelOptions, RateQuote},
    errors::ServiceError,
    models::shipment::{self, ShipmentStatus},
    services::shipping::{BulkLabelResult, ShippingStats},
    ApiResponse, ApiResult, AppState,
};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::error;
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;
use validator::Validate;

#[derive(Debug, Serialize, ToSchema)]
#[schema(example = json!({
    "id": "990e8400-e29b-41d4-a716-446655440000",
    "order_id": "550e8400-e29b-41d4-a716-446655440000",
    "carrier_code": "cj",
    "tracking_number": "610923757203",
    "status": "in_transit",
    "recipient_name": "Kim Minji",
    "recipient_address": "12 Teheran-ro, Gangnam-gu, Seoul",
    "current_location": "Daejeon Hub",
    "shipping_cost": 3900,
    "created_at": "2026-08-20T02:15:00Z",
    "updated_at": "2026-08-21T09:40:00Z"
}))]
pub struct ShipmentSummary {
    pub id: Uuid,
    pub order_id: Uuid,
    /// Carrier code ("cj", "hanjin", "lotte")
    #[schema(example = "cj")]
    pub carrier_code: String,
    /// Carrier-issued tracking number
    #[schema(example = "610923757203")]
    pub tracking_number: Option<String>,
    pub status: ShipmentStatus,
    pub recipient_name: String,
    pub recipient_address: String,
    pub recipient_postal_code: String,
    /// Last carrier-reported location
    pub current_location: Option<String>,
    /// Label cost in KRW
    #[schema(value_type = Option<f64>)]
    pub shipping_cost: Option<Decimal>,
    pub label_url: Option<String>,
    pub failure_reason: Option<String>,
    pub estimated_delivery: Option<DateTime<Utc>>,
    pub shipped_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<shipment::Model> for ShipmentSummary {
    fn from(model: shipment::Model) -> Self {
        Self {
            id: model.id,
            order_id: model.order_id,
            carrier_code: model.carrier_code,
            tracking_number: model.tracking_number,
            status: model.status,
            recipient_name: model.recipient_name,
            recipient_address: model.recipient_address,
            recipient_postal_code: model.recipient_postal_code,
            current_location: model.current_location,
            shipping_cost: model.shipping_cost,
            label_url: model.label_url,
            failure_reason: model.failure_reason,
            estimated_delivery: model.estimated_delivery,
            shipped_at: model.shipped_at,
            delivered_at: model.delivered_at,
            created_at: model.created_at,
            updated_at: model.updated_at,
        }
    }
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
#[schema(example = json!({
    "order_id": "550e8400-e29b-41d4-a716-446655440000",
    "carrier_code": "cj",
    "cod": false,
    "insurance_amount": 50000
}))]
pub struct CreateLabelRequest {
    /// Order to ship
    pub order_id: Uuid,
    /// Chosen carrier code
    #[validate(length(min = 1, max = 32))]
    pub carrier_code: String,
    /// Collect payment on delivery
    #[serde(default)]
    pub cod: bool,
    /// Declared insurance value in KRW
    #[serde(default)]
    #[schema(value_type = Option<f64>)]
    pub insurance_amount: Option<Decimal>,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct BulkLabelRequest {
    #[validate(length(min = 1, max = 100))]
    pub order_ids: Vec<Uuid>,
    #[validate(length(min = 1, max = 32))]
    pub carrier_code: String,
}

#[derive(Debug, Deserialize, Default, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct TrackQuery {
    /// Override the carrier to query; defaults to the shipment's carrier.
    pub carrier: Option<String>,
}

#[derive(Debug, Deserialize, Default, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct StatsQuery {
    /// Include shipments created at or after this instant
    pub from: Option<DateTime<Utc>>,
    /// Include shipments created at or before this instant
    pub to: Option<DateTime<Utc>>,
}

#[utoipa::path(
    get,
    path = "/api/v1/orders/{id}/shipping-rates",
    params(
        ("id" = Uuid, Path, description = "Order ID")
    ),
    responses(
        (status = 200, description = "Available rates, cheapest first", body = ApiResponse<Vec<RateQuote>>),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse)
    ),
    tag = "shipping"
)]
pub async fn get_shipping_rates(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
) -> ApiResult<Vec<RateQuote>> {
    let rates = state.shipping.calculate_rates(order_id).await?;
    Ok(Json(ApiResponse::success(rates)))
}

#[utoipa::path(
    post,
    path = "/api/v1/shipments/labels",
    request_body = CreateLabelRequest,
    responses(
        (status = 201, description = "Label created", body = ApiResponse<ShipmentSummary>),
        (status = 400, description = "Invalid request or unsupported option", body = crate::errors::ErrorResponse),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse),
        (status = 409, description = "Order already has an active shipment", body = crate::errors::ErrorResponse),
        (status = 502, description = "Carrier API failure", body = crate::errors::ErrorResponse)
    ),
    tag = "shipping"
)]
pub async fn create_label(
    State(state): State<AppState>,
    Json(req): Json<CreateLabelRequest>,
) -> Result<(StatusCode, Json<ApiResponse<ShipmentSummary>>), ServiceError> {
    req.validate()?;
    let options = LabelOptions {
        cod: req.cod,
        insurance_amount: req.insurance_amount,
    };
    let shipment = state
        .shipping
        .create_label(req.order_id, &req.carrier_code, options)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::success(ShipmentSummary::from(shipment))),
    ))
}

#[utoipa::path(
    post,
    path = "/api/v1/shipments/labels/bulk",
    request_body = BulkLabelRequest,
    responses(
        (status = 200, description = "Per-order results", body = ApiResponse<BulkLabelResult>),
        (status = 400, description = "Invalid request", body = crate::errors::ErrorResponse)
    ),
    tag = "shipping"
)]
pub async fn create_labels_bulk(
    State(state): State<AppState>,
    Json(req): Json<BulkLabelRequest>,
) -> ApiResult<BulkLabelResult> {
    req.validate()?;
    let result = state
        .shipping
        .create_labels_bulk(req.order_ids, &req.carrier_code)
        .await?;
    Ok(Json(ApiResponse::success(result)))
}

#[utoipa::path(
    get,
    path = "/api/v1/shipments/track/{tracking_number}",
    params(
        ("tracking_number" = String, Path, description = "Carrier tracking number"),
        TrackQuery
    ),
    responses(
        (status = 200, description = "Shipment refreshed from the carrier", body = ApiResponse<ShipmentSummary>),
        (status = 404, description = "Shipment not found", body = crate::errors::ErrorResponse),
        (status = 502, description = "Carrier API failure", body = crate::errors::ErrorResponse)
    ),
    tag = "shipping"
)]
pub async fn track_shipment(
    State(state): State<AppState>,
    Path(tracking_number): Path<String>,
    Query(query): Query<TrackQuery>,
) -> ApiResult<ShipmentSummary> {
    let shipment = state
        .shipping
        .track_shipment(&tracking_number, query.carrier.as_deref())
        .await?;
    Ok(Json(ApiResponse::success(ShipmentSummary::from(shipment))))
}

#[utoipa::path(
    post,
    path = "/api/v1/shipments/{tracking_number}/cancel",
    params(
        ("tracking_number" = String, Path, description = "Carrier tracking number")
    ),
    responses(
        (status = 200, description = "Shipment cancelled", body = ApiResponse<ShipmentSummary>),
        (status = 404, description = "Shipment not found", body = crate::errors::ErrorResponse),
        (status = 409, description = "Shipment is no longer pending", body = crate::errors::ErrorResponse)
    ),
    tag = "shipping"
)]
pub async fn cancel_shipment(
    State(state): State<AppState>,
    Path(tracking_number): Path<String>,
) -> ApiResult<ShipmentSummary> {
    let shipment = state.shipping.cancel_shipment(&tracking_number).await?;
    Ok(Json(ApiResponse::success(ShipmentSummary::from(shipment))))
}

#[utoipa::path(
    get,
    path = "/api/v1/orders/{id}/shipments",
    params(
        ("id" = Uuid, Path, description = "Order ID")
    ),
    responses(
        (status = 200, description = "Shipment history, newest first", body = ApiResponse<Vec<ShipmentSummary>>)
    ),
    tag = "shipping"
)]
pub async fn get_order_shipments(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
) -> ApiResult<Vec<ShipmentSummary>> {
    let shipments = state.shipping.get_shipping_history(order_id).await?;
    Ok(Json(ApiResponse::success(
        shipments.into_iter().map(ShipmentSummary::from).collect(),
    )))
}

#[utoipa::path(
    get,
    path = "/api/v1/shipments/stats",
    params(StatsQuery),
    responses(
        (status = 200, description = "Shipment counts by carrier and status", body = ApiResponse<ShippingStats>)
    ),
    tag = "shipping"
)]
pub async fn shipping_stats(
    State(state): State<AppState>,
    Query(query): Query<StatsQuery>,
) -> ApiResult<ShippingStats> {
    let stats = state.shipping.shipping_stats(query.from, query.to).await?;
    Ok(Json(ApiResponse::success(stats)))
}

#[utoipa::path(
    post,
    path = "/api/v1/shipments/refresh-tracking",
    responses(
        (status = 202, description = "Sweep started", body = ApiResponse<serde_json::Value>)
    ),
    tag = "shipping"
)]
pub async fn refresh_tracking(
    State(state): State<AppState>,
) -> (StatusCode, Json<ApiResponse<serde_json::Value>>) {
    let service = state.shipping.clone();
    tokio::spawn(async move {
        if let Err(e) = service.update_all_tracking().await {
            error!(error = %e, "manually triggered tracking sweep failed");
        }
    });
    (
        StatusCode::ACCEPTED,
        Json(ApiResponse::success(json!({ "status": "sweep_started" }))),
    )
}
