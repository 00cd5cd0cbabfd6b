#![allow(dead_code)]

use std::{
    collections::BTreeMap,
    str::FromStr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use axum::{
    body::{to_bytes, Body},
    http::{Method, Request, StatusCode},
    Router,
};
use chrono::Utc;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use rust_decimal::Decimal;
use sea_orm::{ActiveModelTrait, DatabaseConnection, EntityTrait, Set};
use serde_json::{json, Value};
use storefront_api::{
    app_router,
    auth::{Claims, JwtVerifier},
    config::AppConfig,
    db::{self, DbConfig},
    entities::{order, product},
    errors::ServiceError,
    events::{self, EventSender},
    handlers::{AppServices, ExternalClients},
    notifications::{NotificationError, NotificationSender, OrderConfirmation},
    services::{
        payments::{
            intent::{GatewayIntent, IntentRequest, PaymentIntentGateway},
            vnpay,
        },
        pricing::FlatPricing,
    },
    AppState,
};
use tower::ServiceExt;
use uuid::Uuid;

pub const JWT_SECRET: &str = "integration-test-secret-0123456789abcdef";
pub const WEBHOOK_SECRET: &str = "whsec_integration_test";
pub const VNPAY_SECRET: &str = "VNPAYINTEGRATIONSECRET0123456789";
pub const VNPAY_TMN_CODE: &str = "TESTTMN1";

/// Notifier that records every confirmation instead of delivering it.
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<OrderConfirmation>>,
    fail: AtomicBool,
}

impl RecordingNotifier {
    pub fn fail_deliveries(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<OrderConfirmation> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl NotificationSender for RecordingNotifier {
    async fn send_order_confirmation(
        &self,
        confirmation: &OrderConfirmation,
    ) -> Result<(), NotificationError> {
        self.sent.lock().unwrap().push(confirmation.clone());
        if self.fail.load(Ordering::SeqCst) {
            return Err(NotificationError::Transport("relay down".into()));
        }
        Ok(())
    }
}

/// Gateway that answers every intent request locally.
#[derive(Default)]
pub struct FakeGateway {
    requests: Mutex<Vec<IntentRequest>>,
}

impl FakeGateway {
    pub fn requests(&self) -> Vec<IntentRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl PaymentIntentGateway for FakeGateway {
    async fn create_intent(&self, request: &IntentRequest) -> Result<GatewayIntent, ServiceError> {
        self.requests.lock().unwrap().push(request.clone());
        Ok(GatewayIntent {
            id: format!("pi_{}", request.order_id.simple()),
            client_secret: Some(format!("pi_{}_secret", request.order_id.simple())),
            status: Some("requires_payment_method".into()),
        })
    }
}

/// Application wired to an in-memory SQLite database and fake integrations.
pub struct TestApp {
    router: Router,
    pub state: AppState,
    pub config: AppConfig,
    pub notifier: Arc<RecordingNotifier>,
    pub gateway: Arc<FakeGateway>,
    _event_task: tokio::task::JoinHandle<()>,
}

impl TestApp {
    pub async fn new() -> Self {
        Self::with_pricing(FlatPricing::default()).await
    }

    pub async fn with_pricing(pricing: FlatPricing) -> Self {
        let mut config = AppConfig::new(
            "sqlite::memory:".to_string(),
            JWT_SECRET.to_string(),
            "test".to_string(),
        );
        config.default_currency = "VND".to_string();
        config.low_stock_threshold = 5;
        config.stripe_webhook_secret = Some(WEBHOOK_SECRET.to_string());
        config.vnpay_tmn_code = Some(VNPAY_TMN_CODE.to_string());
        config.vnpay_hash_secret = Some(VNPAY_SECRET.to_string());
        config.vnpay_return_url = Some("https://shop.example/payment/return".to_string());

        let pool = db::establish_connection_with_config(&DbConfig::in_memory_sqlite())
            .await
            .expect("failed to create test database");
        db::run_migrations(&pool)
            .await
            .expect("failed to run migrations in tests");
        let db_arc = Arc::new(pool);

        let (event_sender, event_rx) = EventSender::channel(256);
        let event_sender = Arc::new(event_sender);
        let event_task = tokio::spawn(events::process_events(event_rx));

        let notifier = Arc::new(RecordingNotifier::default());
        let gateway = Arc::new(FakeGateway::default());
        let clients = ExternalClients {
            notifier: notifier.clone(),
            intent_gateway: Some(gateway.clone()),
            pricing: Arc::new(pricing),
        };
        let services = AppServices::new(db_arc.clone(), event_sender.clone(), &config, clients);

        let state = AppState {
            db: db_arc,
            config: Arc::new(config.clone()),
            event_sender,
            jwt: Arc::new(JwtVerifier::new(JWT_SECRET)),
            services,
        };

        Self {
            router: app_router(state.clone()),
            state,
            config,
            notifier,
            gateway,
            _event_task: event_task,
        }
    }

    pub fn db(&self) -> &DatabaseConnection {
        &self.state.db
    }

    pub fn token_for(&self, user_id: Uuid, email: Option<&str>, roles: &[&str]) -> String {
        let now = Utc::now();
        let claims = Claims {
            sub: user_id.to_string(),
            email: email.map(str::to_string),
            name: Some("Test Buyer".into()),
            roles: roles.iter().map(|r| r.to_string()).collect(),
            exp: (now + chrono::Duration::hours(1)).timestamp(),
            iat: now.timestamp(),
        };
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(JWT_SECRET.as_bytes()),
        )
        .expect("encode access token")
    }

    /// A fresh customer id and its bearer token.
    pub fn new_customer(&self) -> (Uuid, String) {
        let id = Uuid::new_v4();
        let token = self.token_for(id, Some("buyer@example.com"), &[]);
        (id, token)
    }

    pub fn admin_token(&self) -> String {
        self.token_for(Uuid::new_v4(), Some("admin@example.com"), &["admin"])
    }

    pub async fn seed_product(&self, name: &str, price: Decimal, stock: i32) -> product::Model {
        let now = Utc::now();
        let slug = name.to_lowercase().replace(' ', "-");
        product::ActiveModel {
            id: Set(Uuid::new_v4()),
            name: Set(name.to_string()),
            slug: Set(slug.clone()),
            sku: Set(format!("SKU-{}", slug.to_uppercase())),
            description: Set(None),
            price: Set(price),
            stock_quantity: Set(stock),
            is_active: Set(true),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(self.db())
        .await
        .expect("seed product")
    }

    pub async fn stock_of(&self, product_id: Uuid) -> i32 {
        product::Entity::find_by_id(product_id)
            .one(self.db())
            .await
            .unwrap()
            .expect("product exists")
            .stock_quantity
    }

    pub async fn order(&self, order_id: Uuid) -> order::Model {
        order::Entity::find_by_id(order_id)
            .one(self.db())
            .await
            .unwrap()
            .expect("order exists")
    }

    /// Sends a request and returns the status with the parsed JSON body.
    pub async fn send(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
        headers: &[(&str, &str)],
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let body = match body {
            Some(json) => {
                builder = builder.header("content-type", "application/json");
                Body::from(serde_json::to_vec(&json).unwrap())
            }
            None => Body::empty(),
        };
        self.send_request(builder.body(body).unwrap()).await
    }

    pub async fn send_request(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("router error during test request");
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or_else(|_| {
                Value::String(String::from_utf8_lossy(&bytes).into_owned())
            })
        };
        (status, value)
    }

    pub async fn authed(
        &self,
        method: Method,
        uri: &str,
        token: &str,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let bearer = format!("Bearer {}", token);
        self.send(method, uri, body, &[("authorization", bearer.as_str())])
            .await
    }

    pub async fn add_to_cart(&self, token: &str, product_id: Uuid, quantity: i32) -> Value {
        let (status, body) = self
            .authed(
                Method::POST,
                "/api/v1/cart/items",
                token,
                Some(json!({ "product_id": product_id, "quantity": quantity })),
            )
            .await;
        assert_eq!(status, StatusCode::OK, "add to cart failed: {}", body);
        body
    }

    pub async fn checkout(&self, token: &str, payment_method: &str) -> (StatusCode, Value) {
        self.authed(
            Method::POST,
            "/api/v1/orders",
            token,
            Some(json!({
                "shipping_address": shipping_address(),
                "payment_method": payment_method,
                "notes": "Leave at the door",
            })),
        )
        .await
    }

    /// Places an order for `quantity` of a fresh product and returns its id.
    pub async fn place_order(
        &self,
        token: &str,
        price: Decimal,
        quantity: i32,
        payment_method: &str,
    ) -> (Uuid, product::Model) {
        let product = self
            .seed_product(&format!("Item {}", Uuid::new_v4().simple()), price, 50)
            .await;
        self.add_to_cart(token, product.id, quantity).await;
        let (status, body) = self.checkout(token, payment_method).await;
        assert_eq!(status, StatusCode::CREATED, "checkout failed: {}", body);
        (uuid_at(&body, "/data/id"), product)
    }

    /// Polls until `count` confirmations have been recorded.
    pub async fn wait_for_confirmations(&self, count: usize) -> Vec<OrderConfirmation> {
        for _ in 0..100 {
            let sent = self.notifier.sent();
            if sent.len() >= count {
                return sent;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.notifier.sent()
    }
}

impl Drop for TestApp {
    fn drop(&mut self) {
        self._event_task.abort();
    }
}

pub fn shipping_address() -> Value {
    json!({
        "full_name": "Nguyen Van A",
        "phone": "+84901234567",
        "address_line1": "12 Ly Thuong Kiet",
        "city": "Ha Noi",
        "country": "VN",
    })
}

pub fn decimal_at(body: &Value, pointer: &str) -> Decimal {
    match body.pointer(pointer) {
        Some(Value::String(s)) => Decimal::from_str(s).expect("decimal string"),
        Some(Value::Number(n)) => Decimal::from_str(&n.to_string()).expect("decimal number"),
        other => panic!("no decimal at {}: {:?}", pointer, other),
    }
}

pub fn uuid_at(body: &Value, pointer: &str) -> Uuid {
    body.pointer(pointer)
        .and_then(Value::as_str)
        .and_then(|s| Uuid::parse_str(s).ok())
        .unwrap_or_else(|| panic!("no uuid at {} in {}", pointer, body))
}

/// Callback parameters as VNPay would send them, signed with the test secret.
pub fn vnpay_callback(order_id: Uuid, amount: i64, response_code: &str) -> BTreeMap<String, String> {
    vnpay_callback_for_ref(&vnpay::txn_ref(order_id, Utc::now()), amount, response_code)
}

/// Same as [`vnpay_callback`] for a reference issued by the payment url endpoint.
pub fn vnpay_callback_for_ref(txn_ref: &str, amount: i64, response_code: &str) -> BTreeMap<String, String> {
    let mut params = BTreeMap::new();
    params.insert("vnp_Amount".to_string(), amount.to_string());
    params.insert("vnp_BankCode".to_string(), "NCB".to_string());
    params.insert("vnp_OrderInfo".to_string(), "Payment for order".to_string());
    params.insert("vnp_ResponseCode".to_string(), response_code.to_string());
    params.insert("vnp_TmnCode".to_string(), VNPAY_TMN_CODE.to_string());
    params.insert("vnp_TransactionNo".to_string(), "14226112".to_string());
    params.insert("vnp_TransactionStatus".to_string(), response_code.to_string());
    params.insert("vnp_TxnRef".to_string(), txn_ref.to_string());
    let signature = vnpay::sign(VNPAY_SECRET, &vnpay::canonical_query(&params));
    params.insert(vnpay::SECURE_HASH.to_string(), signature);
    params.insert(vnpay::SECURE_HASH_TYPE.to_string(), "HmacSHA512".to_string());
    params
}

pub fn query_string(params: &BTreeMap<String, String>) -> String {
    url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(params.iter())
        .finish()
}
