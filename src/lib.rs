//! Parcelhub Shipping API
//!
//! Multi-carrier shipping integration: rate shopping, label issuance,
//! tracking (polled and webhook-driven) and cancellation behind one
//! canonical shipment lifecycle.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

pub mod carriers;
pub mod config;
pub mod db;
pub mod errors;
pub mod events;
pub mod handlers;
pub mod models;
pub mod openapi;
pub mod services;
pub mod tasks;

use axum::{
    extract::State,
    response::Json,
    routing::{get, post},
    Router,
};
use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use utoipa::{OpenApi, ToSchema};

use crate::carriers::CarrierRegistry;
use crate::db::DbPool;
use crate::services::shipping::ShippingService;

/// Shared application state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<DbPool>,
    pub config: config::AppConfig,
    pub event_sender: events::EventSender,
    pub shipping: ShippingService,
    pub registry: Arc<CarrierRegistry>,
}

/// Standard JSON envelope for API responses.
#[derive(Serialize, ToSchema)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub timestamp: String,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: None,
            timestamp: Utc::now().to_rfc3339(),
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            message: Some(message),
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

/// Standard API result type for JSON responses
pub type ApiResult<T> = Result<Json<ApiResponse<T>>, errors::ServiceError>;

/// The versioned API surface, nested under `/api/v1` by the binary.
pub fn api_v1_routes() -> Router<AppState> {
    Router::new()
        .route(
            "/orders/:id/shipping-rates",
            get(handlers::shipping::get_shipping_rates),
        )
        .route(
            "/orders/:id/shipments",
            get(handlers::shipping::get_order_shipments),
        )
        .route("/shipments/labels", post(handlers::shipping::create_label))
        .route(
            "/shipments/labels/bulk",
            post(handlers::shipping::create_labels_bulk),
        )
        .route(
            "/shipments/track/:tracking_number",
            get(handlers::shipping::track_shipment),
        )
        .route(
            "/shipments/:tracking_number/cancel",
            post(handlers::shipping::cancel_shipment),
        )
        .route("/shipments/stats", get(handlers::shipping::shipping_stats))
        .route(
            "/shipments/refresh-tracking",
            post(handlers::shipping::refresh_tracking),
        )
        .route(
            "/webhooks/carriers/:carrier_code",
            post(handlers::webhooks::carrier_webhook),
        )
}

/// Unversioned service routes: liveness, status and the OpenAPI document.
pub fn service_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(|| async { "parcelhub-api up" }))
        .route("/health", get(health_check))
        .route("/status", get(status))
        .route(
            "/api-docs/openapi.json",
            get(|| async { Json(openapi::ApiDoc::openapi()) }),
        )
}

async fn health_check(State(state): State<AppState>) -> Json<Value> {
    let database = match state.db.ping().await {
        Ok(()) => "up",
        Err(_) => "down",
    };
    Json(json!({
        "status": if database == "up" { "healthy" } else { "degraded" },
        "database": database,
        "carriers": state.registry.len(),
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

async fn status(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "service": "parcelhub-api",
        "version": env!("CARGO_PKG_VERSION"),
        "environment": state.config.environment,
        "carriers": state.registry.codes(),
    }))
}
