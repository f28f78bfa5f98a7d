use std::{sync::Arc, time::Duration};

use axum::Router;
use tokio::{
    signal,
    sync::{mpsc, watch},
};
use tower_http::{
    cors::{Any, CorsLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tracing::{error, info};

use parcelhub_api as api;
use parcelhub_api::carriers::CarrierRegistry;
use parcelhub_api::services::shipping::ShippingService;
use parcelhub_api::services::store::ShipmentStore;
use parcelhub_api::tasks::tracking_poller::TrackingPoller;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = api::config::load_config()?;
    api::config::init_tracing(cfg.log_level(), cfg.log_json);

    let db = api::db::establish_connection_from_app_config(&cfg).await?;
    if cfg.auto_migrate {
        api::db::run_migrations(&db).await.map_err(|e| {
            error!("Failed running migrations: {}", e);
            e
        })?;
        api::db::seed_default_carriers(&db).await?;
    }
    let db = Arc::new(db);

    let (event_tx, event_rx) = mpsc::channel(1024);
    let event_sender = api::events::EventSender::new(event_tx);
    tokio::spawn(api::events::process_events(event_rx));

    let store = ShipmentStore::new(db.clone());

    let http_client = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()?;
    let carrier_profiles = store.list_active_carriers().await?;
    let registry = Arc::new(CarrierRegistry::build(
        carrier_profiles,
        &cfg.carriers,
        http_client,
    ));
    if registry.is_empty() {
        error!("no carriers registered; run with APP__AUTO_MIGRATE=true to seed defaults");
    } else {
        info!(carriers = ?registry.codes(), "carrier registry ready");
    }

    let shipping = ShippingService::new(store, registry.clone(), event_sender.clone(), &cfg);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let poller = TrackingPoller::new(
        shipping.clone(),
        Duration::from_secs(cfg.tracking_poll_interval_secs),
    );
    let poller_handle = tokio::spawn(poller.run(shutdown_rx));

    let app_state = api::AppState {
        db,
        config: cfg.clone(),
        event_sender,
        shipping,
        registry,
    };

    let cors_layer = if cfg.is_development() {
        CorsLayer::permissive()
    } else {
        CorsLayer::new().allow_methods(Any).allow_headers(Any)
    };

    let app = Router::new()
        .merge(api::service_routes())
        .nest("/api/v1", api::api_v1_routes())
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(Duration::from_secs(30)))
        .layer(cors_layer)
        .with_state(app_state);

    let addr = format!("{}:{}", cfg.host, cfg.port);
    info!("parcelhub-api listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Stop the poller before exiting so an in-flight sweep can finish.
    let _ = shutdown_tx.send(true);
    let _ = poller_handle.await;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install signal handler");
        sigterm.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
