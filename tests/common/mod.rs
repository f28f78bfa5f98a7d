#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use sea_orm::{ActiveModelTrait, ConnectOptions, Database, Set};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use uuid::Uuid;

use parcelhub_api::carriers::{
    CarrierConnector, CarrierRegistry, LabelData, LabelOptions, Party, RateQuote, TrackingData,
    TrackingEvent, WebhookEvent,
};
use parcelhub_api::config::AppConfig;
use parcelhub_api::db::{self, DbPool};
use parcelhub_api::errors::ServiceError;
use parcelhub_api::events::{Event, EventSender};
use parcelhub_api::models::order::{self, OrderItem};
use parcelhub_api::models::{carrier, shipment};
use parcelhub_api::services::shipping::ShippingService;
use parcelhub_api::services::store::ShipmentStore;

/// Fresh in-memory database with the schema applied. A single pooled
/// connection, because every `sqlite::memory:` connection is its own
/// database.
pub async fn setup_db() -> Arc<DbPool> {
    let mut options = ConnectOptions::new("sqlite::memory:".to_string());
    options
        .max_connections(1)
        .min_connections(1)
        .sqlx_logging(false);
    let pool = Database::connect(options)
        .await
        .expect("failed to open in-memory database");
    db::run_migrations(&pool)
        .await
        .expect("failed to apply schema");
    Arc::new(pool)
}

/// Carrier configuration row for a mock connector.
pub fn mock_profile(code: &str, priority: i32) -> carrier::Model {
    let now = Utc::now();
    carrier::Model {
        id: Uuid::new_v4(),
        code: code.to_string(),
        name: format!("Mock {code}"),
        active: true,
        priority,
        supports_cod: true,
        supports_insurance: code != "lotte",
        supports_international: false,
        base_rate: dec!(3000),
        per_kg_rate: dec!(450),
        region_surcharges: json!({"63": 3000}),
        created_at: now,
        updated_at: now,
    }
}

#[derive(Deserialize)]
struct MockWebhookPayload {
    tracking_number: String,
    status: shipment::ShipmentStatus,
}

/// Programmable carrier double. Each behavior knob defaults to the happy
/// path; tests flip exactly the knobs a scenario needs.
pub struct MockConnector {
    profile: carrier::Model,
    secret: Option<String>,
    /// Quote returned during rate shopping; `None` means unavailable.
    pub quote_cost: Mutex<Option<Decimal>>,
    /// Artificial latency before answering a quote.
    pub quote_delay: Mutex<Option<Duration>>,
    pub fail_quotes: AtomicBool,
    pub fail_labels: AtomicBool,
    /// Whether the carrier accepts a cancellation request.
    pub accept_cancel: AtomicBool,
    /// Status reported per tracking number; unlisted numbers report the
    /// default status.
    pub track_results: Mutex<HashMap<String, Result<shipment::ShipmentStatus, String>>>,
    pub default_track_status: Mutex<shipment::ShipmentStatus>,
    pub track_calls: AtomicUsize,
    label_seq: AtomicUsize,
}

impl MockConnector {
    pub fn new(profile: carrier::Model) -> Self {
        Self {
            profile,
            secret: None,
            quote_cost: Mutex::new(Some(dec!(4000))),
            quote_delay: Mutex::new(None),
            fail_quotes: AtomicBool::new(false),
            fail_labels: AtomicBool::new(false),
            accept_cancel: AtomicBool::new(true),
            track_results: Mutex::new(HashMap::new()),
            default_track_status: Mutex::new(shipment::ShipmentStatus::InTransit),
            track_calls: AtomicUsize::new(0),
            label_seq: AtomicUsize::new(0),
        }
    }

    pub fn with_secret(mut self, secret: &str) -> Self {
        self.secret = Some(secret.to_string());
        self
    }

    pub fn set_quote(&self, cost: Option<Decimal>) {
        *self.quote_cost.lock().unwrap() = cost;
    }

    pub fn set_quote_delay(&self, delay: Duration) {
        *self.quote_delay.lock().unwrap() = Some(delay);
    }

    pub fn set_track_result(
        &self,
        tracking_number: &str,
        result: Result<shipment::ShipmentStatus, &str>,
    ) {
        self.track_results.lock().unwrap().insert(
            tracking_number.to_string(),
            result.map_err(|e| e.to_string()),
        );
    }

    pub fn set_default_track_status(&self, status: shipment::ShipmentStatus) {
        *self.default_track_status.lock().unwrap() = status;
    }
}

#[async_trait]
impl CarrierConnector for MockConnector {
    fn profile(&self) -> &carrier::Model {
        &self.profile
    }

    fn webhook_secret(&self) -> Option<&str> {
        self.secret.as_deref()
    }

    async fn quote(
        &self,
        _weight_kg: f32,
        _destination_postal: &str,
        _items: &[OrderItem],
    ) -> Result<Option<RateQuote>, ServiceError> {
        let delay = *self.quote_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_quotes.load(Ordering::SeqCst) {
            return Err(ServiceError::CarrierApiError("quote endpoint down".into()));
        }
        let cost = *self.quote_cost.lock().unwrap();
        Ok(cost.map(|cost| RateQuote {
            carrier_code: self.profile.code.clone(),
            carrier_name: self.profile.name.clone(),
            service_name: format!("{} Standard", self.profile.name),
            cost,
            estimated_days: 2,
            priority: self.profile.priority,
        }))
    }

    async fn create_label(
        &self,
        _order: &order::Model,
        _sender: &Party,
        _receiver: &Party,
        _options: &LabelOptions,
    ) -> Result<LabelData, ServiceError> {
        if self.fail_labels.load(Ordering::SeqCst) {
            return Err(ServiceError::CarrierApiError(
                "label endpoint rejected the request".into(),
            ));
        }
        let seq = self.label_seq.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(LabelData {
            tracking_number: format!("MOCK-{}-{:04}", self.profile.code.to_uppercase(), seq),
            label_url: Some("https://labels.example/mock.pdf".into()),
            estimated_delivery: None,
            cost: dec!(3000),
        })
    }

    async fn track(&self, tracking_number: &str) -> Result<TrackingData, ServiceError> {
        self.track_calls.fetch_add(1, Ordering::SeqCst);
        let result = self
            .track_results
            .lock()
            .unwrap()
            .get(tracking_number)
            .cloned()
            .unwrap_or_else(|| Ok(*self.default_track_status.lock().unwrap()));
        let status = result.map_err(ServiceError::CarrierApiError)?;
        Ok(TrackingData {
            status,
            current_location: Some("Daejeon Hub".into()),
            estimated_delivery: None,
            events: vec![TrackingEvent {
                timestamp: Utc::now(),
                status,
                location: Some("Daejeon Hub".into()),
                description: format!("carrier reported {status}"),
            }],
            raw: json!({"tracking_number": tracking_number}),
        })
    }

    async fn cancel_label(&self, _tracking_number: &str) -> Result<bool, ServiceError> {
        Ok(self.accept_cancel.load(Ordering::SeqCst))
    }

    fn parse_webhook(&self, payload: &[u8]) -> Option<WebhookEvent> {
        let parsed: MockWebhookPayload = serde_json::from_slice(payload).ok()?;
        Some(WebhookEvent {
            tracking_number: parsed.tracking_number,
            status: parsed.status,
            location: None,
            timestamp: Some(Utc::now()),
        })
    }
}

/// Everything a service-level test needs, in one place.
pub struct TestHarness {
    pub db: Arc<DbPool>,
    pub store: ShipmentStore,
    pub service: ShippingService,
    pub events: mpsc::Receiver<Event>,
}

impl TestHarness {
    /// Builds a service over an in-memory database and the given connectors.
    pub async fn with_connectors(connectors: Vec<Arc<MockConnector>>) -> Self {
        let db = setup_db().await;
        let store = ShipmentStore::new(db.clone());

        let mut registry = CarrierRegistry::new();
        for connector in connectors {
            registry.register(connector);
        }

        let (event_tx, events) = mpsc::channel(64);
        let event_sender = EventSender::new(event_tx);

        let mut cfg = AppConfig::new(
            "sqlite::memory:".into(),
            "127.0.0.1".into(),
            18_080,
            "test".into(),
        );
        cfg.carrier_quote_timeout_secs = 1;
        cfg.tracking_concurrency = 4;

        let service = ShippingService::new(store.clone(), Arc::new(registry), event_sender, &cfg);
        Self {
            db,
            store,
            service,
            events,
        }
    }

    /// Single mock carrier under the code "cj".
    pub async fn single_carrier() -> (Self, Arc<MockConnector>) {
        let connector = Arc::new(MockConnector::new(mock_profile("cj", 1)));
        let harness = Self::with_connectors(vec![connector.clone()]).await;
        (harness, connector)
    }

    pub async fn insert_order(&self, postal_code: &str, weight_kg: f32) -> order::Model {
        let now = Utc::now();
        order::ActiveModel {
            id: Set(Uuid::new_v4()),
            order_number: Set(format!("ORD-{}", Uuid::new_v4().simple())),
            status: Set("paid".into()),
            customer_name: Set("Kim Minji".into()),
            customer_phone: Set(Some("010-1234-5678".into())),
            shipping_address: Set("12 Teheran-ro, Gangnam-gu, Seoul".into()),
            postal_code: Set(postal_code.into()),
            items: Set(json!([
                {"sku": "SKU-1", "quantity": 1, "weight_kg": weight_kg}
            ])),
            tracking_number: Set(None),
            delivered_at: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&*self.db)
        .await
        .expect("failed to insert test order")
    }

    /// Inserts a shipment row directly, bypassing label issuance.
    pub async fn insert_shipment(
        &self,
        order_id: Uuid,
        tracking_number: &str,
        status: shipment::ShipmentStatus,
    ) -> shipment::Model {
        let now = Utc::now();
        shipment::ActiveModel {
            id: Set(Uuid::new_v4()),
            order_id: Set(order_id),
            carrier_code: Set("cj".into()),
            tracking_number: Set(Some(tracking_number.to_string())),
            status: Set(status),
            sender_name: Set("Parcelhub Fulfillment".into()),
            sender_phone: Set(None),
            sender_address: Set("1 Fulfillment-ro, Icheon-si".into()),
            sender_postal_code: Set("17379".into()),
            recipient_name: Set("Kim Minji".into()),
            recipient_phone: Set(Some("010-1234-5678".into())),
            recipient_address: Set("12 Teheran-ro, Gangnam-gu, Seoul".into()),
            recipient_postal_code: Set("06236".into()),
            shipping_cost: Set(Some(dec!(3000))),
            insurance_amount: Set(None),
            weight_kg: Set(1.0),
            dimensions_cm: Set(None),
            current_location: Set(None),
            tracking_events: Set(json!([])),
            label_url: Set(None),
            failure_reason: Set(None),
            estimated_delivery: Set(None),
            shipped_at: Set(None),
            delivered_at: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&*self.db)
        .await
        .expect("failed to insert test shipment")
    }

    /// Inserts a non-terminal shipment row that never got a tracking number.
    pub async fn insert_shipment_without_tracking(&self, order_id: Uuid) -> shipment::Model {
        let now = Utc::now();
        shipment::ActiveModel {
            id: Set(Uuid::new_v4()),
            order_id: Set(order_id),
            carrier_code: Set("cj".into()),
            tracking_number: Set(None),
            status: Set(shipment::ShipmentStatus::Pending),
            sender_name: Set("Parcelhub Fulfillment".into()),
            sender_phone: Set(None),
            sender_address: Set("1 Fulfillment-ro, Icheon-si".into()),
            sender_postal_code: Set("17379".into()),
            recipient_name: Set("Kim Minji".into()),
            recipient_phone: Set(None),
            recipient_address: Set("12 Teheran-ro, Gangnam-gu, Seoul".into()),
            recipient_postal_code: Set("06236".into()),
            shipping_cost: Set(None),
            insurance_amount: Set(None),
            weight_kg: Set(1.0),
            dimensions_cm: Set(None),
            current_location: Set(None),
            tracking_events: Set(json!([])),
            label_url: Set(None),
            failure_reason: Set(None),
            estimated_delivery: Set(None),
            shipped_at: Set(None),
            delivered_at: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&*self.db)
        .await
        .expect("failed to insert test shipment")
    }

    /// Drains the event channel without blocking.
    pub fn drain_events(&mut self) -> Vec<Event> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}

/// Hex HMAC-SHA256 over `body`, the signature scheme carriers use for
/// webhook callbacks.
pub fn sign_webhook(secret: &str, body: &[u8]) -> String {
    use hmac::{Hmac, Mac};
    use sha2::Sha256;
    let mut mac =
        Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}
