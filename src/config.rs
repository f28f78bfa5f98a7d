use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::path::Path;
use thiserror::Error;
use tracing::{error, info};
use validator::Validate;

const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const DEFAULT_PORT: u16 = 8080;
const CONFIG_DIR: &str = "config";
const DEFAULT_POLL_INTERVAL_SECS: u64 = 1800;
const DEFAULT_TRACKING_CONCURRENCY: usize = 8;
const DEFAULT_QUOTE_TIMEOUT_SECS: u64 = 10;

/// Per-carrier API credentials and endpoint, supplied as external
/// configuration. A carrier without an `api_key` quotes as unavailable
/// instead of failing startup.
#[derive(Clone, Debug, Deserialize, Default)]
pub struct CarrierSettings {
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub account_code: String,
    /// HMAC secret for inbound webhook signature verification, if the
    /// carrier signs its callbacks.
    #[serde(default)]
    pub webhook_secret: Option<String>,
}

/// Merchant sender snapshot stamped onto every label.
#[derive(Clone, Debug, Deserialize, Validate)]
pub struct SenderConfig {
    #[validate(length(min = 1))]
    pub name: String,
    #[serde(default)]
    pub phone: Option<String>,
    #[validate(length(min = 1))]
    pub address: String,
    #[validate(length(min = 1))]
    pub postal_code: String,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            name: "Parcelhub Fulfillment".to_string(),
            phone: None,
            address: "1 Fulfillment-ro, Icheon-si, Gyeonggi-do".to_string(),
            postal_code: "17379".to_string(),
        }
    }
}

/// Application configuration with validation.
#[derive(Clone, Debug, Deserialize, Validate)]
pub struct AppConfig {
    /// Database connection URL
    pub database_url: String,

    /// Server host address
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Application environment
    pub environment: String,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log in JSON format (structured logging)
    #[serde(default)]
    pub log_json: bool,

    /// Whether to create missing tables and seed default carriers on startup
    #[serde(default)]
    pub auto_migrate: bool,

    /// Interval between tracking poller sweeps (seconds)
    #[serde(default = "default_poll_interval")]
    pub tracking_poll_interval_secs: u64,

    /// Maximum concurrent shipment refreshes during a sweep
    #[serde(default = "default_tracking_concurrency")]
    #[validate(range(min = 1, max = 64))]
    pub tracking_concurrency: usize,

    /// Per-connector timeout during rate shopping (seconds)
    #[serde(default = "default_quote_timeout")]
    pub carrier_quote_timeout_secs: u64,

    /// Merchant sender details stamped onto labels
    #[serde(default)]
    pub sender: SenderConfig,

    /// Per-carrier credentials, keyed by carrier code ("cj", "hanjin", ...)
    #[serde(default)]
    pub carriers: HashMap<String, CarrierSettings>,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}
fn default_poll_interval() -> u64 {
    DEFAULT_POLL_INTERVAL_SECS
}
fn default_tracking_concurrency() -> usize {
    DEFAULT_TRACKING_CONCURRENCY
}
fn default_quote_timeout() -> u64 {
    DEFAULT_QUOTE_TIMEOUT_SECS
}

impl AppConfig {
    /// Minimal constructor, used by tests.
    pub fn new(database_url: String, host: String, port: u16, environment: String) -> Self {
        Self {
            database_url,
            host,
            port,
            environment,
            log_level: default_log_level(),
            log_json: false,
            auto_migrate: false,
            tracking_poll_interval_secs: default_poll_interval(),
            tracking_concurrency: default_tracking_concurrency(),
            carrier_quote_timeout_secs: default_quote_timeout(),
            sender: SenderConfig::default(),
            carriers: HashMap::new(),
        }
    }

    pub fn is_development(&self) -> bool {
        self.environment.eq_ignore_ascii_case("development")
            || self.environment.eq_ignore_ascii_case("test")
    }

    pub fn log_level(&self) -> &str {
        &self.log_level
    }
}

#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] ConfigError),
    #[error("Configuration validation failed: {0}")]
    Validation(#[from] validator::ValidationErrors),
}

/// Initializes tracing using the provided log level as the default filter.
pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default_directive = format!("parcelhub_api={},tower_http=debug", level);
    let filter_directive = env::var("RUST_LOG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(default_directive);

    if json {
        let _ = fmt().with_env_filter(filter_directive).json().try_init();
    } else {
        let _ = fmt().with_env_filter(filter_directive).try_init();
    }
}

/// Loads application configuration.
///
/// Layers configuration sources in this order:
/// 1. Built-in defaults
/// 2. config/default.toml
/// 3. config/{env}.toml
/// 4. Environment variables (APP__*)
pub fn load_config() -> Result<AppConfig, AppConfigError> {
    let run_env = env::var("RUN_ENV")
        .or_else(|_| env::var("APP_ENV"))
        .unwrap_or_else(|_| DEFAULT_ENV.to_string());
    info!("Loading configuration for environment: {}", run_env);

    if !Path::new(CONFIG_DIR).exists() {
        info!(
            "Config directory '{}' not found; relying on built-in defaults and environment variables",
            CONFIG_DIR
        );
    }

    let config = Config::builder()
        .set_default("database_url", "sqlite://parcelhub.db?mode=rwc")?
        .set_default("host", "0.0.0.0")?
        .set_default("port", DEFAULT_PORT as i64)?
        .set_default("environment", DEFAULT_ENV)?
        .set_default("log_level", DEFAULT_LOG_LEVEL)?
        .set_default("log_json", false)?
        .add_source(File::with_name(&format!("{}/default", CONFIG_DIR)).required(false))
        .add_source(File::with_name(&format!("{}/{}", CONFIG_DIR, run_env)).required(false))
        .add_source(Environment::with_prefix("APP").separator("__"))
        .build()?;

    let app_config: AppConfig = config.try_deserialize()?;

    app_config.validate().map_err(|e| {
        error!("Configuration validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    info!("Configuration loaded successfully");
    Ok(app_config)
}
