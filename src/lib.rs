//! Storefront API library
//!
//! Catalog, carts, checkout, order lifecycle and payment settlement behind an axum
//! HTTP surface.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

pub mod auth;
pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod events;
pub mod handlers;
pub mod migrator;
pub mod notifications;
pub mod services;
pub mod telemetry;

use std::{sync::Arc, time::Duration};

use axum::{
    extract::FromRef,
    http::HeaderValue,
    response::Json,
    routing::{get, post, put},
    Router,
};
use chrono::Utc;
use sea_orm::DatabaseConnection;
use serde::Serialize;
use tower_http::{
    cors::{Any, CorsLayer},
    timeout::TimeoutLayer,
};

use crate::{auth::JwtVerifier, config::AppConfig, events::EventSender, handlers::AppServices};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

// App state definition
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<DatabaseConnection>,
    pub config: Arc<AppConfig>,
    pub event_sender: Arc<EventSender>,
    pub jwt: Arc<JwtVerifier>,
    pub services: AppServices,
}

impl FromRef<AppState> for Arc<JwtVerifier> {
    fn from_ref(state: &AppState) -> Self {
        state.jwt.clone()
    }
}

#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub message: Option<String>,
    pub errors: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<ResponseMeta>,
}

#[derive(Debug, Serialize)]
pub struct ResponseMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub timestamp: String,
}

impl ResponseMeta {
    fn capture() -> Self {
        Self {
            request_id: telemetry::current_request_id().map(|rid| rid.as_str().to_string()),
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: None,
            errors: None,
            meta: Some(ResponseMeta::capture()),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Standard API result type for JSON responses
pub type ApiResult<T> = Result<Json<ApiResponse<T>>, errors::ServiceError>;

pub fn api_v1_routes() -> Router<AppState> {
    let catalog = Router::new()
        .route("/products", get(handlers::products::list_products))
        .route("/products/:id", get(handlers::products::get_product));

    let cart = Router::new()
        .route(
            "/cart",
            get(handlers::carts::get_cart).delete(handlers::carts::clear_cart),
        )
        .route("/cart/items", post(handlers::carts::add_item))
        .route(
            "/cart/items/:product_id",
            put(handlers::carts::update_item).delete(handlers::carts::remove_item),
        )
        .route("/cart/merge", post(handlers::carts::merge_cart));

    let orders = Router::new()
        .route(
            "/orders",
            post(handlers::orders::create_order).get(handlers::orders::list_orders),
        )
        .route("/orders/:id", get(handlers::orders::get_order))
        .route("/orders/:id/cancel", post(handlers::orders::cancel_order));

    let payments = Router::new()
        .route(
            "/payments/stripe/intent",
            post(handlers::payments::create_stripe_intent),
        )
        .route(
            "/payments/stripe/webhook",
            post(handlers::payments::stripe_webhook),
        )
        .route(
            "/payments/vnpay/url",
            post(handlers::payments::create_vnpay_url),
        )
        .route(
            "/payments/vnpay/return",
            get(handlers::payments::vnpay_return),
        )
        .route("/payments/vnpay/ipn", get(handlers::payments::vnpay_ipn));

    let admin = Router::new()
        .route("/admin/orders", get(handlers::admin::list_orders))
        .route("/admin/orders/:id", get(handlers::admin::get_order))
        .route(
            "/admin/orders/:id/status",
            axum::routing::patch(handlers::admin::override_order_status),
        )
        .route("/admin/dashboard", get(handlers::admin::dashboard))
        .route("/admin/products", post(handlers::admin::create_product));

    Router::new()
        .route("/health", get(handlers::health::health))
        .merge(catalog)
        .merge(cart)
        .merge(orders)
        .merge(payments)
        .merge(admin)
}

/// CORS from configured origins; permissive only in development.
pub fn cors_layer(cfg: &AppConfig) -> CorsLayer {
    let origins: Vec<HeaderValue> = cfg
        .cors_origins()
        .iter()
        .filter_map(|origin| HeaderValue::from_str(origin).ok())
        .collect();

    if !origins.is_empty() {
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    } else if cfg.is_development() {
        CorsLayer::permissive()
    } else {
        CorsLayer::new()
    }
}

/// Full application router with middleware applied.
pub fn app_router(state: AppState) -> Router {
    let cors = cors_layer(&state.config);
    Router::new()
        .route("/", get(|| async { "storefront-api up" }))
        .nest("/api/v1", api_v1_routes())
        .layer(telemetry::http_trace_layer())
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .layer(cors)
        // Outermost, so every layer above sees the request id
        .layer(axum::middleware::from_fn(telemetry::request_id_middleware))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::DateTime;

    #[tokio::test]
    async fn success_response_includes_request_metadata() {
        let response =
            telemetry::scope_request_id(telemetry::RequestId::new("meta-123"), async {
                ApiResponse::success("ok")
            })
            .await;

        let meta = response.meta.expect("metadata expected");
        assert_eq!(meta.request_id.as_deref(), Some("meta-123"));
        DateTime::parse_from_rfc3339(&meta.timestamp).expect("timestamp should parse");
    }
}
