use crate::{ApiResponse, AppState};
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::Json,
};
use serde_json::json;
use tracing::warn;

const SIGNATURE_HEADER: &str = "x-webhook-signature";

/// Inbound carrier status callback.
///
/// Always answers 200 once the request reaches us: carriers retry on any
/// non-2xx, and a payload we cannot use (bad signature, unknown tracking
/// number, unparseable body) should be dropped, not redelivered forever.
#[utoipa::path(
    post,
    path = "/api/v1/webhooks/carriers/{carrier_code}",
    request_body(content = String, content_type = "application/json", description = "Raw carrier payload, passed to the connector unmodified"),
    params(
        ("carrier_code" = String, Path, description = "Carrier code (\"cj\", \"hanjin\", \"lotte\")")
    ),
    responses(
        (status = 200, description = "Webhook acknowledged", body = ApiResponse<serde_json::Value>)
    ),
    tag = "webhooks"
)]
pub async fn carrier_webhook(
    State(state): State<AppState>,
    Path(carrier_code): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, Json<ApiResponse<serde_json::Value>>) {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok());

    let processed = match state
        .shipping
        .handle_carrier_webhook(&carrier_code, &body, signature)
        .await
    {
        Ok(processed) => processed,
        Err(e) => {
            warn!(carrier = %carrier_code, error = %e, "webhook processing failed");
            false
        }
    };

    (
        StatusCode::OK,
        Json(ApiResponse::success(json!({
            "received": true,
            "processed": processed,
        }))),
    )
}
