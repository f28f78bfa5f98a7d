use chrono::Utc;
use rust_decimal_macros::dec;
use sea_orm::{
    ConnectOptions, ConnectionTrait, Database, DatabaseConnection, EntityTrait, PaginatorTrait,
    Schema, Set,
};
use serde_json::json;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::errors::ServiceError;
use crate::models::{carrier, order, shipment};

/// Type alias for a database connection pool
pub type DbPool = DatabaseConnection;

/// Establishes a connection pool to the database.
pub async fn establish_connection(database_url: &str) -> Result<DbPool, ServiceError> {
    let mut options = ConnectOptions::new(database_url.to_string());
    options
        .max_connections(10)
        .min_connections(1)
        .connect_timeout(Duration::from_secs(30))
        .idle_timeout(Duration::from_secs(600))
        .sqlx_logging(false);

    let db = Database::connect(options).await?;
    info!("Database connection established");
    Ok(db)
}

pub async fn establish_connection_from_app_config(cfg: &AppConfig) -> Result<DbPool, ServiceError> {
    establish_connection(&cfg.database_url).await
}

/// Creates any missing tables from the entity definitions.
pub async fn run_migrations(db: &DbPool) -> Result<(), ServiceError> {
    let backend = db.get_database_backend();
    let schema = Schema::new(backend);

    let mut orders = schema.create_table_from_entity(order::Entity);
    db.execute(backend.build(orders.if_not_exists())).await?;

    let mut carriers = schema.create_table_from_entity(carrier::Entity);
    db.execute(backend.build(carriers.if_not_exists())).await?;

    let mut shipments = schema.create_table_from_entity(shipment::Entity);
    db.execute(backend.build(shipments.if_not_exists())).await?;

    info!("Schema migrations applied");
    Ok(())
}

/// Seeds the default Korean parcel carriers when the carrier table is empty.
/// Rates are KRW; surcharge prefixes cover Jeju (63) and remote islands (40).
pub async fn seed_default_carriers(db: &DbPool) -> Result<(), ServiceError> {
    let existing = carrier::Entity::find().count(db).await?;
    if existing > 0 {
        return Ok(());
    }

    let now = Utc::now();
    let rows = vec![
        carrier::ActiveModel {
            id: Set(Uuid::new_v4()),
            code: Set("cj".into()),
            name: Set("CJ Logistics".into()),
            active: Set(true),
            priority: Set(1),
            supports_cod: Set(true),
            supports_insurance: Set(true),
            supports_international: Set(false),
            base_rate: Set(dec!(3000)),
            per_kg_rate: Set(dec!(450)),
            region_surcharges: Set(json!({"63": 3000, "40": 5000})),
            created_at: Set(now),
            updated_at: Set(now),
        },
        carrier::ActiveModel {
            id: Set(Uuid::new_v4()),
            code: Set("hanjin".into()),
            name: Set("Hanjin Express".into()),
            active: Set(true),
            priority: Set(2),
            supports_cod: Set(false),
            supports_insurance: Set(true),
            supports_international: Set(true),
            base_rate: Set(dec!(3500)),
            per_kg_rate: Set(dec!(600)),
            region_surcharges: Set(json!({"63": 4000})),
            created_at: Set(now),
            updated_at: Set(now),
        },
        carrier::ActiveModel {
            id: Set(Uuid::new_v4()),
            code: Set("lotte".into()),
            name: Set("Lotte Global Logistics".into()),
            active: Set(true),
            priority: Set(3),
            supports_cod: Set(true),
            supports_insurance: Set(false),
            supports_international: Set(true),
            base_rate: Set(dec!(2800)),
            per_kg_rate: Set(dec!(480)),
            region_surcharges: Set(json!({"63": 3500, "40": 4500})),
            created_at: Set(now),
            updated_at: Set(now),
        },
    ];

    carrier::Entity::insert_many(rows).exec(db).await?;
    info!("Seeded default carrier configuration");
    Ok(())
}
