use std::collections::BTreeMap;

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::{
    auth::AuthUser,
    services::payments::{
        intent::{PaymentIntentResponse, WebhookAck, SIGNATURE_HEADER},
        vnpay::{IpnResponse, PaymentUrlResponse, ReturnResult},
    },
    ApiResponse, ApiResult, AppState,
};

const FALLBACK_CLIENT_IP: &str = "127.0.0.1";

#[derive(Debug, Deserialize)]
pub struct OrderPaymentRequest {
    pub order_id: Uuid,
}

/// First hop of `x-forwarded-for`, then `x-real-ip`.
pub fn client_ip(headers: &HeaderMap) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .or_else(|| headers.get("x-real-ip").and_then(|v| v.to_str().ok()))
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
        .unwrap_or(FALLBACK_CLIENT_IP)
        .to_string()
}

pub async fn create_stripe_intent(
    State(state): State<AppState>,
    user: AuthUser,
    Json(request): Json<OrderPaymentRequest>,
) -> ApiResult<PaymentIntentResponse> {
    let intent = state
        .services
        .intent_payments
        .create_intent(user.user_id, request.order_id)
        .await?;
    Ok(Json(ApiResponse::success(intent)))
}

/// Takes the raw body: the signature covers the exact bytes sent.
pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookAck>, crate::errors::ServiceError> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok());
    let ack = state
        .services
        .intent_payments
        .handle_webhook(&body, signature)
        .await?;
    Ok(Json(ack))
}

pub async fn create_vnpay_url(
    State(state): State<AppState>,
    user: AuthUser,
    headers: HeaderMap,
    Json(request): Json<OrderPaymentRequest>,
) -> ApiResult<PaymentUrlResponse> {
    let response = state
        .services
        .vnpay_payments
        .create_payment_url(user.user_id, request.order_id, &client_ip(&headers))
        .await?;
    Ok(Json(ApiResponse::success(response)))
}

pub async fn vnpay_return(
    State(state): State<AppState>,
    Query(params): Query<BTreeMap<String, String>>,
) -> ApiResult<ReturnResult> {
    let result = state.services.vnpay_payments.process_return(&params).await?;
    Ok(Json(ApiResponse::success(result)))
}

pub async fn vnpay_ipn(
    State(state): State<AppState>,
    Query(params): Query<BTreeMap<String, String>>,
) -> (StatusCode, Json<IpnResponse>) {
    let response = state.services.vnpay_payments.process_ipn(&params).await;
    let status = if response.is_signature_failure() {
        StatusCode::BAD_REQUEST
    } else {
        StatusCode::OK
    };
    (status, Json(response))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn client_ip_prefers_forwarded_chain() {
        let mut headers = HeaderMap::new();
        assert_eq!(client_ip(&headers), FALLBACK_CLIENT_IP);

        headers.insert("x-real-ip", HeaderValue::from_static("10.0.0.9"));
        assert_eq!(client_ip(&headers), "10.0.0.9");

        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.7, 10.0.0.1"),
        );
        assert_eq!(client_ip(&headers), "203.0.113.7");
    }
}
