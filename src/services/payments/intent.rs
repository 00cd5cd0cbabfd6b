//! Intent/webhook settlement (Stripe-compatible).

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use sea_orm::DatabaseConnection;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::{
    payable_order, record_payment_attempt,
    settlement::{SettlementKind, SettlementService},
    to_minor_units,
};
use crate::{entities::order::PaymentMethod, errors::ServiceError};

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "stripe-signature";
pub const DEFAULT_API_BASE: &str = "https://api.stripe.com";

pub const EVENT_SUCCEEDED: &str = "payment_intent.succeeded";
pub const EVENT_FAILED: &str = "payment_intent.payment_failed";

#[derive(Debug, Clone)]
pub struct IntentRequest {
    pub order_id: Uuid,
    pub order_number: String,
    /// Smallest currency unit
    pub amount: i64,
    pub currency: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayIntent {
    pub id: String,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

/// Creates payment intents at the gateway.
#[async_trait]
pub trait PaymentIntentGateway: Send + Sync {
    async fn create_intent(&self, request: &IntentRequest) -> Result<GatewayIntent, ServiceError>;
}

pub struct StripeGateway {
    client: reqwest::Client,
    secret_key: String,
    api_base: String,
}

impl StripeGateway {
    pub fn new(secret_key: impl Into<String>, api_base: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            secret_key: secret_key.into(),
            api_base: api_base
                .unwrap_or_else(|| DEFAULT_API_BASE.to_string())
                .trim_end_matches('/')
                .to_string(),
        }
    }
}

#[async_trait]
impl PaymentIntentGateway for StripeGateway {
    #[instrument(skip(self, request), fields(order_id = %request.order_id))]
    async fn create_intent(&self, request: &IntentRequest) -> Result<GatewayIntent, ServiceError> {
        let params = [
            ("amount", request.amount.to_string()),
            ("currency", request.currency.to_lowercase()),
            ("metadata[order_id]", request.order_id.to_string()),
            ("metadata[order_number]", request.order_number.clone()),
            ("automatic_payment_methods[enabled]", "true".to_string()),
        ];

        let response = self
            .client
            .post(format!("{}/v1/payment_intents", self.api_base))
            .basic_auth(&self.secret_key, Some(""))
            .form(&params)
            .send()
            .await
            .map_err(|e| ServiceError::ExternalServiceError(format!("Stripe API error: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            warn!(%status, "Stripe rejected payment intent: {}", error_text);
            return Err(ServiceError::ExternalServiceError(format!(
                "Stripe returned {}",
                status
            )));
        }

        let intent: GatewayIntent = response.json().await.map_err(|e| {
            ServiceError::ExternalServiceError(format!("Failed to parse Stripe response: {}", e))
        })?;
        info!(intent_id = %intent.id, "PaymentIntent created");
        Ok(intent)
    }
}

/// Event envelope. `data.object` stays untyped until the event type is known to be handled.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEvent {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub data: WebhookEventData,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WebhookEventData {
    #[serde(default)]
    pub object: serde_json::Value,
}

impl WebhookEvent {
    /// The payment intent carried by `payment_intent.*` events.
    pub fn intent_object(&self) -> Result<IntentObject, ServiceError> {
        IntentObject::deserialize(&self.data.object).map_err(|e| {
            ServiceError::ValidationError(format!(
                "invalid {} payload: {}",
                self.event_type, e
            ))
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct IntentObject {
    pub id: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub last_payment_error: Option<LastPaymentError>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LastPaymentError {
    #[serde(default)]
    pub message: Option<String>,
}

/// Checks `t=<unix>,v1=<hex>` signature headers over `"{t}.{payload}"`.
#[derive(Clone)]
pub struct WebhookVerifier {
    secret: String,
    tolerance_secs: u64,
}

impl WebhookVerifier {
    pub fn new(secret: impl Into<String>, tolerance_secs: u64) -> Self {
        Self {
            secret: secret.into(),
            tolerance_secs,
        }
    }

    pub fn verify(&self, payload: &[u8], header: &str) -> Result<WebhookEvent, ServiceError> {
        self.verify_at(payload, header, Utc::now().timestamp())
    }

    /// Verifies against an explicit clock, then parses the payload.
    pub fn verify_at(
        &self,
        payload: &[u8],
        header: &str,
        now: i64,
    ) -> Result<WebhookEvent, ServiceError> {
        let mut timestamp = None;
        let mut signatures = Vec::new();
        for part in header.split(',') {
            match part.trim().split_once('=') {
                Some(("t", value)) => timestamp = value.parse::<i64>().ok(),
                Some(("v1", value)) => signatures.push(value),
                _ => {}
            }
        }

        let timestamp = timestamp.ok_or_else(|| {
            ServiceError::SignatureVerification("missing signature timestamp".to_string())
        })?;
        if signatures.is_empty() {
            return Err(ServiceError::SignatureVerification(
                "missing v1 signature".to_string(),
            ));
        }
        if now.abs_diff(timestamp) > self.tolerance_secs {
            return Err(ServiceError::SignatureVerification(
                "signature timestamp outside tolerance".to_string(),
            ));
        }

        let verified = signatures.iter().any(|candidate| {
            hex::decode(candidate)
                .map(|bytes| self.mac_for(timestamp, payload).verify_slice(&bytes).is_ok())
                .unwrap_or(false)
        });
        if !verified {
            return Err(ServiceError::SignatureVerification(
                "webhook signature mismatch".to_string(),
            ));
        }

        serde_json::from_slice(payload)
            .map_err(|e| ServiceError::ValidationError(format!("invalid webhook payload: {}", e)))
    }

    /// Builds the header value a gateway would send for `payload`.
    pub fn sign(&self, payload: &[u8], timestamp: i64) -> String {
        let digest = self.mac_for(timestamp, payload).finalize().into_bytes();
        format!("t={},v1={}", timestamp, hex::encode(digest))
    }

    fn mac_for(&self, timestamp: i64, payload: &[u8]) -> HmacSha256 {
        // HMAC accepts keys of any length.
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .unwrap_or_else(|_| unreachable!("hmac key of any length"));
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(payload);
        mac
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PaymentIntentResponse {
    pub order_id: Uuid,
    pub order_number: String,
    pub intent_id: String,
    pub client_secret: Option<String>,
    pub amount: i64,
    pub currency: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WebhookOutcome {
    Paid {
        order_id: Uuid,
        settlement: SettlementKind,
    },
    Failed {
        order_id: Uuid,
        settlement: SettlementKind,
    },
    Ignored {
        event_type: String,
    },
    Dropped {
        reason: String,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct WebhookAck {
    pub received: bool,
    pub outcome: WebhookOutcome,
}

/// Protocol A: create an intent, then settle from the verified webhook.
#[derive(Clone)]
pub struct IntentPaymentService {
    db: Arc<DatabaseConnection>,
    settlement: SettlementService,
    gateway: Option<Arc<dyn PaymentIntentGateway>>,
    verifier: Option<WebhookVerifier>,
}

impl IntentPaymentService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        settlement: SettlementService,
        gateway: Option<Arc<dyn PaymentIntentGateway>>,
        verifier: Option<WebhookVerifier>,
    ) -> Self {
        Self {
            db,
            settlement,
            gateway,
            verifier,
        }
    }

    #[instrument(skip(self))]
    pub async fn create_intent(
        &self,
        user_id: Uuid,
        order_id: Uuid,
    ) -> Result<PaymentIntentResponse, ServiceError> {
        let gateway = self.gateway.as_ref().ok_or_else(|| {
            ServiceError::ServiceUnavailable("card payments are not configured".to_string())
        })?;

        let order = payable_order(&*self.db, user_id, order_id).await?;
        let amount = to_minor_units(order.total, &order.currency)?;
        let intent = gateway
            .create_intent(&IntentRequest {
                order_id: order.id,
                order_number: order.order_number.clone(),
                amount,
                currency: order.currency.clone(),
            })
            .await?;

        record_payment_attempt(
            &*self.db,
            order.id,
            PaymentMethod::Stripe,
            Some(intent.id.clone()),
        )
        .await?;

        Ok(PaymentIntentResponse {
            order_id: order.id,
            order_number: order.order_number,
            intent_id: intent.id,
            client_secret: intent.client_secret,
            amount,
            currency: order.currency,
        })
    }

    /// Verifies and applies a webhook delivery.
    ///
    /// Only a bad signature or malformed payload is an error. Unknown event types and
    /// events that cannot be tied to an order are acknowledged so the gateway stops
    /// redelivering them.
    #[instrument(skip(self, payload, signature))]
    pub async fn handle_webhook(
        &self,
        payload: &[u8],
        signature: Option<&str>,
    ) -> Result<WebhookAck, ServiceError> {
        let verifier = self.verifier.as_ref().ok_or_else(|| {
            ServiceError::ServiceUnavailable("webhook secret is not configured".to_string())
        })?;
        let signature = signature.ok_or_else(|| {
            ServiceError::SignatureVerification("missing signature header".to_string())
        })?;
        let event = verifier.verify(payload, signature)?;

        let outcome = match event.event_type.as_str() {
            EVENT_SUCCEEDED | EVENT_FAILED => self.settle(&event).await?,
            other => {
                info!(event_type = other, "Ignoring webhook event");
                WebhookOutcome::Ignored {
                    event_type: other.to_string(),
                }
            }
        };

        Ok(WebhookAck {
            received: true,
            outcome,
        })
    }

    async fn settle(&self, event: &WebhookEvent) -> Result<WebhookOutcome, ServiceError> {
        let intent = event.intent_object()?;
        let order_id = match intent
            .metadata
            .get("order_id")
            .and_then(|raw| Uuid::parse_str(raw).ok())
        {
            Some(order_id) => order_id,
            None => {
                warn!(intent_id = %intent.id, "Webhook event carries no usable order id");
                return Ok(WebhookOutcome::Dropped {
                    reason: "missing order reference".to_string(),
                });
            }
        };

        let result = if event.event_type == EVENT_SUCCEEDED {
            self.settlement
                .mark_order_paid(order_id, &intent.id)
                .await
                .map(|outcome| WebhookOutcome::Paid {
                    order_id,
                    settlement: outcome.kind(),
                })
        } else {
            let reason = intent
                .last_payment_error
                .as_ref()
                .and_then(|e| e.message.clone())
                .unwrap_or_else(|| "payment failed".to_string());
            self.settlement
                .mark_order_payment_failed(order_id, &reason)
                .await
                .map(|outcome| WebhookOutcome::Failed {
                    order_id,
                    settlement: outcome.kind(),
                })
        };

        match result {
            Err(ServiceError::NotFound(_)) => {
                warn!(order_id = %order_id, "Webhook references unknown order");
                Ok(WebhookOutcome::Dropped {
                    reason: "unknown order".to_string(),
                })
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    const SECRET: &str = "whsec_test_secret";
    const NOW: i64 = 1_735_689_600;

    fn payload() -> Vec<u8> {
        serde_json::json!({
            "id": "evt_1",
            "type": EVENT_SUCCEEDED,
            "data": { "object": { "id": "pi_1", "metadata": { "order_id": Uuid::nil().to_string() } } }
        })
        .to_string()
        .into_bytes()
    }

    #[test]
    fn accepts_own_signature() {
        let verifier = WebhookVerifier::new(SECRET, 300);
        let body = payload();
        let header = verifier.sign(&body, NOW);

        let event = verifier.verify_at(&body, &header, NOW + 10).unwrap();
        assert_eq!(event.event_type, EVENT_SUCCEEDED);
        assert_eq!(event.intent_object().unwrap().id, "pi_1");
    }

    #[test]
    fn envelope_parses_without_an_intent_object() {
        let verifier = WebhookVerifier::new(SECRET, 300);
        let body = serde_json::json!({
            "id": "evt_balance",
            "type": "balance.available",
            "data": { "object": { "object": "balance", "available": [] } }
        })
        .to_string()
        .into_bytes();
        let header = verifier.sign(&body, NOW);

        let event = verifier.verify_at(&body, &header, NOW).unwrap();
        assert_eq!(event.event_type, "balance.available");
        assert_matches!(event.intent_object(), Err(ServiceError::ValidationError(_)));
    }

    #[test]
    fn rejects_tampered_payload() {
        let verifier = WebhookVerifier::new(SECRET, 300);
        let body = payload();
        let header = verifier.sign(&body, NOW);
        let mut tampered = body.clone();
        tampered[10] ^= 1;

        assert_matches!(
            verifier.verify_at(&tampered, &header, NOW),
            Err(ServiceError::SignatureVerification(_))
        );
    }

    #[test]
    fn rejects_other_secret_and_stale_timestamps() {
        let body = payload();
        let header = WebhookVerifier::new("other", 300).sign(&body, NOW);
        let verifier = WebhookVerifier::new(SECRET, 300);

        assert_matches!(
            verifier.verify_at(&body, &header, NOW),
            Err(ServiceError::SignatureVerification(_))
        );

        let header = verifier.sign(&body, NOW);
        assert_matches!(
            verifier.verify_at(&body, &header, NOW + 301),
            Err(ServiceError::SignatureVerification(_))
        );
    }

    #[test]
    fn rejects_malformed_headers() {
        let verifier = WebhookVerifier::new(SECRET, 300);
        let body = payload();
        for header in ["", "t=abc,v1=00", "v1=00", "t=1735689600", "t=1735689600,v1=zz"] {
            assert_matches!(
                verifier.verify_at(&body, header, NOW),
                Err(ServiceError::SignatureVerification(_)),
                "header {:?}",
                header
            );
        }
    }

    #[test]
    fn any_matching_v1_is_enough() {
        let verifier = WebhookVerifier::new(SECRET, 300);
        let body = payload();
        let valid = verifier.sign(&body, NOW);
        let digest = valid.split_once("v1=").map(|(_, d)| d).unwrap();
        let header = format!("t={},v1={},v1={}", NOW, "00".repeat(32), digest);

        assert!(verifier.verify_at(&body, &header, NOW).is_ok());
    }
}
