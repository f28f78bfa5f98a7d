use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Parcelhub Shipping API",
        version = "0.3.0",
        description = r#"
Multi-carrier shipping integration service.

Rate shopping across the registered Korean parcel carriers, label issuance,
tracking refresh (polled and webhook-driven) and cancellation, all expressed
in one canonical shipment lifecycle:

`pending -> picked_up -> in_transit -> out_for_delivery -> delivered`

with `cancelled`, `failed` and `returned` as the remaining terminal states.
        "#
    ),
    paths(
        crate::handlers::shipping::get_shipping_rates,
        crate::handlers::shipping::create_label,
        crate::handlers::shipping::create_labels_bulk,
        crate::handlers::shipping::track_shipment,
        crate::handlers::shipping::cancel_shipment,
        crate::handlers::shipping::get_order_shipments,
        crate::handlers::shipping::shipping_stats,
        crate::handlers::shipping::refresh_tracking,
        crate::handlers::webhooks::carrier_webhook,
    ),
    components(schemas(
        crate::errors::ErrorResponse,
        crate::carriers::RateQuote,
        crate::carriers::TrackingEvent,
        crate::models::shipment::ShipmentStatus,
        crate::handlers::shipping::ShipmentSummary,
        crate::handlers::shipping::CreateLabelRequest,
        crate::handlers::shipping::BulkLabelRequest,
        crate::services::shipping::BulkLabelEntry,
        crate::services::shipping::BulkLabelResult,
        crate::services::shipping::CarrierStats,
        crate::services::shipping::StatusCount,
        crate::services::shipping::ShippingStats,
        crate::services::shipping::TrackingSweepSummary,
    )),
    tags(
        (name = "shipping", description = "Rate shopping, labels, tracking and cancellation"),
        (name = "webhooks", description = "Inbound carrier status callbacks")
    )
)]
pub struct ApiDoc;
