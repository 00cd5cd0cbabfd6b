pub mod admin;
pub mod carts;
pub mod common;
pub mod health;
pub mod orders;
pub mod payments;
pub mod products;

use std::sync::Arc;

use crate::{
    config::AppConfig,
    db::DbPool,
    events::EventSender,
    notifications::{HttpNotificationSender, LogNotificationSender, NotificationSender},
    services::{
        cart::CartService,
        catalog::CatalogService,
        checkout::CheckoutService,
        orders::OrderService,
        payments::{
            intent::{IntentPaymentService, PaymentIntentGateway, StripeGateway, WebhookVerifier},
            vnpay::{VnpayConfig, VnpayPaymentService},
            SettlementService,
        },
        pricing::{FlatPricing, PricingPolicy},
        reports::ReportService,
    },
};

/// Outbound integrations. Tests swap these for fakes.
#[derive(Clone)]
pub struct ExternalClients {
    pub notifier: Arc<dyn NotificationSender>,
    pub intent_gateway: Option<Arc<dyn PaymentIntentGateway>>,
    pub pricing: Arc<dyn PricingPolicy>,
}

impl ExternalClients {
    pub fn from_config(config: &AppConfig) -> Self {
        let notifier: Arc<dyn NotificationSender> = match &config.notification_webhook_url {
            Some(url) => Arc::new(HttpNotificationSender::new(url.clone())),
            None => Arc::new(LogNotificationSender),
        };
        let intent_gateway = config.stripe_secret_key.as_ref().map(|key| {
            Arc::new(StripeGateway::new(
                key.clone(),
                Some(config.stripe_api_base.clone()),
            )) as Arc<dyn PaymentIntentGateway>
        });
        Self {
            notifier,
            intent_gateway,
            pricing: Arc::new(FlatPricing::default()),
        }
    }
}

/// Service container shared by every handler.
#[derive(Clone)]
pub struct AppServices {
    pub catalog: Arc<CatalogService>,
    pub cart: Arc<CartService>,
    pub checkout: Arc<CheckoutService>,
    pub orders: Arc<OrderService>,
    pub settlement: Arc<SettlementService>,
    pub intent_payments: Arc<IntentPaymentService>,
    pub vnpay_payments: Arc<VnpayPaymentService>,
    pub reports: Arc<ReportService>,
}

impl AppServices {
    pub fn new(
        db_pool: Arc<DbPool>,
        event_sender: Arc<EventSender>,
        config: &AppConfig,
        clients: ExternalClients,
    ) -> Self {
        let settlement = SettlementService::new(
            db_pool.clone(),
            event_sender.clone(),
            clients.notifier.clone(),
        );
        let verifier = config.stripe_webhook_secret.as_ref().map(|secret| {
            WebhookVerifier::new(secret.clone(), config.payment_webhook_tolerance_secs)
        });

        Self {
            catalog: Arc::new(CatalogService::new(db_pool.clone(), event_sender.clone())),
            cart: Arc::new(CartService::new(db_pool.clone(), event_sender.clone())),
            checkout: Arc::new(CheckoutService::new(
                db_pool.clone(),
                event_sender.clone(),
                clients.notifier.clone(),
                clients.pricing.clone(),
                config.default_currency.clone(),
            )),
            orders: Arc::new(OrderService::new(db_pool.clone(), event_sender.clone())),
            intent_payments: Arc::new(IntentPaymentService::new(
                db_pool.clone(),
                settlement.clone(),
                clients.intent_gateway.clone(),
                verifier,
            )),
            vnpay_payments: Arc::new(VnpayPaymentService::new(
                db_pool.clone(),
                settlement.clone(),
                VnpayConfig::from_app_config(config),
            )),
            settlement: Arc::new(settlement),
            reports: Arc::new(ReportService::new(db_pool, config.low_stock_threshold)),
        }
    }
}
