use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use std::path::Path;
use thiserror::Error;
use tracing::{error, info};
use validator::{Validate, ValidationError, ValidationErrors};

/// Default values for configuration
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const DEFAULT_PORT: u16 = 8080;
const CONFIG_DIR: &str = "config";
const DEFAULT_STRIPE_API_BASE: &str = "https://api.stripe.com";
const DEFAULT_VNPAY_PAYMENT_URL: &str = "https://sandbox.vnpayment.vn/paymentv2/vpcpay.html";
const DEV_DEFAULT_JWT_SECRET: &str = "storefront_development_secret_do_not_ship_7f3k9q2m";

/// Application configuration structure with validation
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
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
    #[validate(custom = "validate_log_level")]
    pub log_level: String,

    /// Log in JSON format (structured logging)
    #[serde(default)]
    pub log_json: bool,

    /// Whether to run database migrations on startup
    #[serde(default)]
    pub auto_migrate: bool,

    /// DB pool: max connections
    #[serde(default = "default_db_max_connections")]
    #[validate(range(min = 1))]
    pub db_max_connections: u32,

    /// DB pool: min connections
    #[serde(default = "default_db_min_connections")]
    pub db_min_connections: u32,

    /// DB pool acquire timeout (seconds)
    #[serde(default = "default_db_acquire_timeout_secs")]
    pub db_acquire_timeout_secs: u64,

    /// Secret used to verify bearer tokens (HS256)
    #[validate(length(min = 32))]
    pub jwt_secret: String,

    /// CORS: comma-separated list of allowed origins
    #[serde(default)]
    pub cors_allowed_origins: Option<String>,

    /// ISO 4217 currency used for new orders
    #[serde(default = "default_currency")]
    #[validate(custom = "validate_currency")]
    pub default_currency: String,

    /// Products at or below this stock level are reported on the dashboard
    #[serde(default = "default_low_stock_threshold")]
    pub low_stock_threshold: i32,

    /// Event channel capacity for async event processing
    #[serde(default = "default_event_channel_capacity")]
    #[validate(range(min = 1))]
    pub event_channel_capacity: usize,

    /// Stripe secret API key; intent creation is disabled without it
    #[serde(default)]
    pub stripe_secret_key: Option<String>,

    /// Stripe webhook signing secret; webhooks are rejected without it
    #[serde(default)]
    pub stripe_webhook_secret: Option<String>,

    #[serde(default = "default_stripe_api_base")]
    pub stripe_api_base: String,

    /// Webhook timestamp tolerance (seconds)
    #[serde(default = "default_webhook_tolerance_secs")]
    pub payment_webhook_tolerance_secs: u64,

    /// VNPay merchant (terminal) code
    #[serde(default)]
    pub vnpay_tmn_code: Option<String>,

    /// VNPay HMAC-SHA512 secret
    #[serde(default)]
    pub vnpay_hash_secret: Option<String>,

    #[serde(default = "default_vnpay_payment_url")]
    pub vnpay_payment_url: String,

    /// Where VNPay sends the browser after payment
    #[serde(default)]
    pub vnpay_return_url: Option<String>,

    /// Lifetime of a VNPay payment URL (minutes)
    #[serde(default = "default_vnpay_expire_minutes")]
    #[validate(range(min = 1, max = 1440))]
    pub vnpay_expire_minutes: i64,

    /// Optional mail relay endpoint for order confirmations
    #[serde(default)]
    pub notification_webhook_url: Option<String>,
}

impl AppConfig {
    /// Creates a new configuration with defaults for everything optional
    pub fn new(database_url: String, jwt_secret: String, environment: String) -> Self {
        Self {
            database_url,
            host: "0.0.0.0".to_string(),
            port: default_port(),
            environment,
            log_level: default_log_level(),
            log_json: false,
            auto_migrate: false,
            db_max_connections: default_db_max_connections(),
            db_min_connections: default_db_min_connections(),
            db_acquire_timeout_secs: default_db_acquire_timeout_secs(),
            jwt_secret,
            cors_allowed_origins: None,
            default_currency: default_currency(),
            low_stock_threshold: default_low_stock_threshold(),
            event_channel_capacity: default_event_channel_capacity(),
            stripe_secret_key: None,
            stripe_webhook_secret: None,
            stripe_api_base: default_stripe_api_base(),
            payment_webhook_tolerance_secs: default_webhook_tolerance_secs(),
            vnpay_tmn_code: None,
            vnpay_hash_secret: None,
            vnpay_payment_url: default_vnpay_payment_url(),
            vnpay_return_url: None,
            vnpay_expire_minutes: default_vnpay_expire_minutes(),
            notification_webhook_url: None,
        }
    }

    /// Checks if running in production environment
    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("production")
    }

    /// Checks if running in development environment
    pub fn is_development(&self) -> bool {
        self.environment.eq_ignore_ascii_case("development")
    }

    /// Parsed CORS origins, empty when unset
    pub fn cors_origins(&self) -> Vec<String> {
        self.cors_allowed_origins
            .as_deref()
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|origin| !origin.is_empty())
            .map(str::to_string)
            .collect()
    }

    fn validate_additional_constraints(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();

        if !self.is_development() && self.jwt_secret.trim() == DEV_DEFAULT_JWT_SECRET {
            let mut err = ValidationError::new("jwt_secret_default_dev");
            err.message = Some(
                "The bundled development JWT secret must not be used outside development. Set APP__JWT_SECRET."
                    .into(),
            );
            errors.add("jwt_secret", err);
        }

        if self.is_production() && self.cors_origins().is_empty() {
            let mut err = ValidationError::new("cors_allowed_origins_required");
            err.message = Some("Set APP__CORS_ALLOWED_ORIGINS in production".into());
            errors.add("cors_allowed_origins", err);
        }

        // VNPay needs all three pieces or none.
        let vnpay_parts = [
            self.vnpay_tmn_code.is_some(),
            self.vnpay_hash_secret.is_some(),
            self.vnpay_return_url.is_some(),
        ];
        if vnpay_parts.iter().any(|set| *set) && !vnpay_parts.iter().all(|set| *set) {
            let mut err = ValidationError::new("vnpay_incomplete");
            err.message = Some(
                "vnpay_tmn_code, vnpay_hash_secret and vnpay_return_url must be set together"
                    .into(),
            );
            errors.add("vnpay_tmn_code", err);
        }

        if errors.errors().is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("Configuration loading failed: {0}")]
    Load(#[from] ConfigError),

    #[error("Configuration validation failed: {0}")]
    Validation(#[from] validator::ValidationErrors),
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_db_max_connections() -> u32 {
    16
}
fn default_db_min_connections() -> u32 {
    2
}
fn default_db_acquire_timeout_secs() -> u64 {
    8
}

fn default_currency() -> String {
    "VND".to_string()
}

fn default_low_stock_threshold() -> i32 {
    5
}

fn default_event_channel_capacity() -> usize {
    1024
}

fn default_stripe_api_base() -> String {
    DEFAULT_STRIPE_API_BASE.to_string()
}

fn default_webhook_tolerance_secs() -> u64 {
    300
}

fn default_vnpay_payment_url() -> String {
    DEFAULT_VNPAY_PAYMENT_URL.to_string()
}

fn default_vnpay_expire_minutes() -> i64 {
    15
}

/// Validates log level values
fn validate_log_level(level: &str) -> Result<(), ValidationError> {
    let valid_levels = ["trace", "debug", "info", "warn", "error"];
    if valid_levels.contains(&level.to_lowercase().as_str()) {
        Ok(())
    } else {
        let mut err = ValidationError::new("log_level");
        err.message = Some("Must be one of: trace, debug, info, warn, error".into());
        Err(err)
    }
}

fn validate_currency(code: &str) -> Result<(), ValidationError> {
    if code.len() == 3 && code.chars().all(|c| c.is_ascii_uppercase()) {
        Ok(())
    } else {
        let mut err = ValidationError::new("default_currency");
        err.message = Some("Must be a three-letter upper-case ISO 4217 code".into());
        Err(err)
    }
}

/// Initializes tracing using the provided log level as the default filter
pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default_directive = format!("storefront_api={},tower_http=info", level);
    let filter_directive = env::var("RUST_LOG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(default_directive);
    let filter = EnvFilter::new(filter_directive);

    if json {
        let _ = fmt().with_env_filter(filter).json().try_init();
    } else {
        let _ = fmt().with_env_filter(filter).try_init();
    }
}

/// Loads application configuration
///
/// Layers configuration sources in this order:
/// 1. Built-in defaults
/// 2. Default config (config/default.toml)
/// 3. Environment-specific config (config/{env}.toml)
/// 4. Environment variables (APP__*)
pub fn load_config() -> Result<AppConfig, AppConfigError> {
    let run_env = env::var("APP_ENV").unwrap_or_else(|_| DEFAULT_ENV.to_string());
    load_config_from(Path::new(CONFIG_DIR), &run_env)
}

fn load_config_from(dir: &Path, run_env: &str) -> Result<AppConfig, AppConfigError> {
    info!("Loading configuration for environment: {}", run_env);

    if !dir.exists() {
        info!(
            "Config directory '{}' not found; relying on built-in defaults and environment variables",
            dir.display()
        );
    }

    let mut builder = Config::builder()
        .set_default("database_url", "sqlite://storefront.db?mode=rwc")?
        .set_default("host", "0.0.0.0")?
        .set_default("port", DEFAULT_PORT as i64)?
        .set_default("environment", run_env)?
        .set_default("log_level", DEFAULT_LOG_LEVEL)?
        .set_default("log_json", false)?;

    if run_env.eq_ignore_ascii_case(DEFAULT_ENV) {
        builder = builder.set_default("jwt_secret", DEV_DEFAULT_JWT_SECRET)?;
    }

    let config = builder
        .add_source(File::with_name(&dir.join("default").to_string_lossy()).required(false))
        .add_source(File::with_name(&dir.join(run_env).to_string_lossy()).required(false))
        .add_source(Environment::with_prefix("APP").separator("__"))
        .build()?;

    if config.get_string("jwt_secret").is_err() {
        error!("JWT secret is not configured. Set APP__JWT_SECRET.");
        return Err(AppConfigError::Load(ConfigError::NotFound(
            "jwt_secret is required but not configured".into(),
        )));
    }

    let app_config: AppConfig = config.try_deserialize()?;

    app_config.validate().map_err(|e| {
        error!("Configuration validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    app_config.validate_additional_constraints().map_err(|e| {
        error!("Configuration security validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    info!("Configuration loaded successfully");
    Ok(app_config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn base_config() -> AppConfig {
        AppConfig::new(
            "sqlite::memory:".into(),
            "a_production_grade_secret_value_0123456789".into(),
            "production".into(),
        )
    }

    #[test]
    fn production_requires_cors_origins() {
        let cfg = base_config();
        assert!(cfg.validate_additional_constraints().is_err());
    }

    #[test]
    fn production_with_origins_passes() {
        let mut cfg = base_config();
        cfg.cors_allowed_origins = Some("https://shop.example.com, https://admin.example.com".into());
        assert!(cfg.validate_additional_constraints().is_ok());
        assert_eq!(cfg.cors_origins().len(), 2);
    }

    #[test]
    fn dev_secret_rejected_outside_development() {
        let mut cfg = base_config();
        cfg.cors_allowed_origins = Some("https://shop.example.com".into());
        cfg.jwt_secret = DEV_DEFAULT_JWT_SECRET.into();
        assert!(cfg.validate_additional_constraints().is_err());
    }

    #[test]
    fn partial_vnpay_settings_are_rejected() {
        let mut cfg = base_config();
        cfg.environment = "development".into();
        cfg.vnpay_tmn_code = Some("DEMO0001".into());
        assert!(cfg.validate_additional_constraints().is_err());

        cfg.vnpay_hash_secret = Some("secret".into());
        cfg.vnpay_return_url = Some("https://shop.example.com/payment/return".into());
        assert!(cfg.validate_additional_constraints().is_ok());
    }

    #[test]
    fn currency_must_be_iso_code() {
        assert!(validate_currency("VND").is_ok());
        assert!(validate_currency("usd").is_err());
        assert!(validate_currency("EURO").is_err());
    }

    #[test]
    fn loads_layered_file_config() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("default.toml"),
            "port = 9090\ndefault_currency = \"USD\"\n",
        )
        .unwrap();
        fs::write(
            dir.path().join("development.toml"),
            "low_stock_threshold = 2\n",
        )
        .unwrap();

        let cfg = load_config_from(dir.path(), "development").unwrap();
        assert_eq!(cfg.port, 9090);
        assert_eq!(cfg.default_currency, "USD");
        assert_eq!(cfg.low_stock_threshold, 2);
        assert_eq!(cfg.vnpay_expire_minutes, 15);
    }

    #[test]
    fn invalid_log_level_fails_validation() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("default.toml"), "log_level = \"chatty\"\n").unwrap();

        let result = load_config_from(dir.path(), "development");
        assert!(matches!(result, Err(AppConfigError::Validation(_))));
    }
}
