//! Redirect/return settlement (VNPay 2.1.0).
//!
//! The gateway echoes every signed parameter back on the browser redirect and on the
//! server-to-server IPN. Both paths go through [`VnpayPaymentService::verify_callback`]
//! so they reach the same verdict for the same parameter set, and both settle through
//! the same guarded transitions, so a duplicate notification changes nothing.

use std::{collections::BTreeMap, sync::Arc};

use chrono::{DateTime, Duration, FixedOffset, Utc};
use hmac::{Hmac, Mac};
use rust_decimal::{prelude::ToPrimitive, Decimal, RoundingStrategy};
use sea_orm::DatabaseConnection;
use serde::Serialize;
use sha2::Sha512;
use tracing::{error, info, instrument, warn};
use url::form_urlencoded::byte_serialize;
use uuid::Uuid;

use super::{
    payable_order, record_payment_attempt,
    settlement::{SettlementOutcome, SettlementService},
};
use crate::{
    config::AppConfig,
    entities::order::{self, PaymentMethod, PaymentStatus},
    errors::ServiceError,
    services::orders::find_order,
};

type HmacSha512 = Hmac<Sha512>;

pub const VERSION: &str = "2.1.0";
pub const CURRENCY: &str = "VND";
pub const SUCCESS_CODE: &str = "00";
pub const SECURE_HASH: &str = "vnp_SecureHash";
pub const SECURE_HASH_TYPE: &str = "vnp_SecureHashType";

const TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S";
const GATEWAY_UTC_OFFSET_SECS: i32 = 7 * 3600;

#[derive(Debug, Clone)]
pub struct VnpayConfig {
    pub tmn_code: String,
    pub hash_secret: String,
    pub payment_url: String,
    pub return_url: String,
    pub expire_minutes: i64,
}

impl VnpayConfig {
    /// `None` unless merchant code, secret and return url are all configured.
    pub fn from_app_config(cfg: &AppConfig) -> Option<Self> {
        Some(Self {
            tmn_code: cfg.vnpay_tmn_code.clone()?,
            hash_secret: cfg.vnpay_hash_secret.clone()?,
            payment_url: cfg.vnpay_payment_url.clone(),
            return_url: cfg.vnpay_return_url.clone()?,
            expire_minutes: cfg.vnpay_expire_minutes,
        })
    }
}

/// `k=v&...` over keys in byte order, both sides form-url-encoded.
pub fn canonical_query(params: &BTreeMap<String, String>) -> String {
    params
        .iter()
        .map(|(key, value)| {
            format!(
                "{}={}",
                byte_serialize(key.as_bytes()).collect::<String>(),
                byte_serialize(value.as_bytes()).collect::<String>()
            )
        })
        .collect::<Vec<_>>()
        .join("&")
}

fn mac(secret: &str) -> HmacSha512 {
    HmacSha512::new_from_slice(secret.as_bytes())
        .unwrap_or_else(|_| unreachable!("hmac key of any length"))
}

/// Lowercase hex HMAC-SHA512 of `data`.
pub fn sign(secret: &str, data: &str) -> String {
    let mut mac = mac(secret);
    mac.update(data.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Recomputes the signature over everything except the hash fields.
pub fn verify_params(secret: &str, params: &BTreeMap<String, String>) -> bool {
    let Some(supplied) = params.get(SECURE_HASH) else {
        return false;
    };
    let Ok(supplied) = hex::decode(supplied.to_ascii_lowercase()) else {
        return false;
    };

    let signed: BTreeMap<String, String> = params
        .iter()
        .filter(|(key, _)| key.as_str() != SECURE_HASH && key.as_str() != SECURE_HASH_TYPE)
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();

    let mut mac = mac(secret);
    mac.update(canonical_query(&signed).as_bytes());
    mac.verify_slice(&supplied).is_ok()
}

/// Message for a `vnp_ResponseCode`.
pub fn response_message(code: &str) -> &'static str {
    match code {
        "00" => "Transaction successful",
        "07" => "Amount deducted; transaction flagged as suspicious",
        "09" => "Card or account is not registered for internet banking",
        "10" => "Card or account verification failed more than 3 times",
        "11" => "Payment session expired",
        "12" => "Card or account is locked",
        "13" => "Incorrect one-time password",
        "24" => "Transaction cancelled by customer",
        "51" => "Insufficient account balance",
        "65" => "Daily transaction limit exceeded",
        "75" => "Bank is under maintenance",
        "79" => "Payment password entered incorrectly too many times",
        "99" => "Other error",
        _ => "Unknown error",
    }
}

/// `vnp_Amount` is always the amount times 100.
pub fn gateway_amount(amount: Decimal) -> Result<i64, ServiceError> {
    (amount * Decimal::ONE_HUNDRED)
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_i64()
        .ok_or_else(|| ServiceError::ValidationError(format!("amount {} out of range", amount)))
}

/// `vnp_TxnRef` for one payment attempt: `<order id as simple hex>-<attempt millis>`.
///
/// The gateway refuses a reference it has already seen, so every attempt on the
/// same order carries its own suffix.
pub fn txn_ref(order_id: Uuid, attempted_at: DateTime<Utc>) -> String {
    format!("{}-{}", order_id.simple(), attempted_at.timestamp_millis())
}

/// Recovers the order id from a `vnp_TxnRef`. A bare order id is accepted too.
pub fn order_id_from_txn_ref(txn_ref: &str) -> Result<Uuid, ServiceError> {
    let order_part = txn_ref
        .split_once('-')
        .map_or(txn_ref, |(order_part, _)| order_part);
    if order_part.len() != 32 {
        return Err(ServiceError::ValidationError(
            "malformed vnp_TxnRef".to_string(),
        ));
    }
    Uuid::parse_str(order_part)
        .map_err(|_| ServiceError::ValidationError("malformed vnp_TxnRef".to_string()))
}

fn gateway_time(at: DateTime<Utc>) -> String {
    let offset = FixedOffset::east_opt(GATEWAY_UTC_OFFSET_SECS)
        .unwrap_or_else(|| unreachable!("+07:00 is a valid offset"));
    at.with_timezone(&offset).format(TIMESTAMP_FORMAT).to_string()
}

#[derive(Debug, Clone)]
pub struct PaymentUrlRequest {
    pub order_id: Uuid,
    pub amount: Decimal,
    pub order_info: String,
    pub ip_addr: String,
    pub created_at: DateTime<Utc>,
}

/// Builds the signed redirect url.
pub fn build_payment_url(
    config: &VnpayConfig,
    request: &PaymentUrlRequest,
) -> Result<String, ServiceError> {
    let expires_at = request.created_at + Duration::minutes(config.expire_minutes);

    let mut params = BTreeMap::new();
    params.insert("vnp_Version".to_string(), VERSION.to_string());
    params.insert("vnp_Command".to_string(), "pay".to_string());
    params.insert("vnp_TmnCode".to_string(), config.tmn_code.clone());
    params.insert(
        "vnp_Amount".to_string(),
        gateway_amount(request.amount)?.to_string(),
    );
    params.insert("vnp_CurrCode".to_string(), CURRENCY.to_string());
    params.insert(
        "vnp_TxnRef".to_string(),
        txn_ref(request.order_id, request.created_at),
    );
    params.insert("vnp_OrderInfo".to_string(), request.order_info.clone());
    params.insert("vnp_OrderType".to_string(), "other".to_string());
    params.insert("vnp_Locale".to_string(), "vn".to_string());
    params.insert("vnp_ReturnUrl".to_string(), config.return_url.clone());
    params.insert("vnp_IpAddr".to_string(), request.ip_addr.clone());
    params.insert(
        "vnp_CreateDate".to_string(),
        gateway_time(request.created_at),
    );
    params.insert("vnp_ExpireDate".to_string(), gateway_time(expires_at));

    let query = canonical_query(&params);
    let signature = sign(&config.hash_secret, &query);
    Ok(format!(
        "{}?{}&{}={}",
        config.payment_url, query, SECURE_HASH, signature
    ))
}

/// Fields of a callback whose signature checked out.
#[derive(Debug, Clone, PartialEq)]
pub struct VerifiedCallback {
    pub order_id: Uuid,
    pub txn_ref: String,
    pub amount: i64,
    pub response_code: String,
    pub transaction_status: Option<String>,
    pub transaction_no: Option<String>,
}

impl VerifiedCallback {
    pub fn is_success(&self) -> bool {
        self.response_code == SUCCESS_CODE
            && self
                .transaction_status
                .as_deref()
                .map_or(true, |status| status == SUCCESS_CODE)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PaymentUrlResponse {
    pub order_id: Uuid,
    pub order_number: String,
    pub txn_ref: String,
    pub payment_url: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReturnResult {
    pub order_id: Uuid,
    pub order_number: String,
    pub success: bool,
    pub response_code: String,
    pub message: String,
    pub payment_status: PaymentStatus,
}

/// IPN acknowledgement in the gateway's own shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IpnResponse {
    #[serde(rename = "RspCode")]
    pub rsp_code: &'static str,
    #[serde(rename = "Message")]
    pub message: &'static str,
}

impl IpnResponse {
    pub const CONFIRMED: Self = Self::new("00", "Confirm Success");
    pub const ORDER_NOT_FOUND: Self = Self::new("01", "Order not found");
    pub const ALREADY_CONFIRMED: Self = Self::new("02", "Order already confirmed");
    pub const INVALID_AMOUNT: Self = Self::new("04", "Invalid amount");
    pub const INVALID_SIGNATURE: Self = Self::new("97", "Invalid signature");
    pub const UNKNOWN_ERROR: Self = Self::new("99", "Unknown error");

    const fn new(rsp_code: &'static str, message: &'static str) -> Self {
        Self { rsp_code, message }
    }

    pub fn is_signature_failure(&self) -> bool {
        self.rsp_code == Self::INVALID_SIGNATURE.rsp_code
    }
}

/// Protocol B: signed redirect out, verified return and IPN back.
#[derive(Clone)]
pub struct VnpayPaymentService {
    db: Arc<DatabaseConnection>,
    settlement: SettlementService,
    config: Option<VnpayConfig>,
}

impl VnpayPaymentService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        settlement: SettlementService,
        config: Option<VnpayConfig>,
    ) -> Self {
        Self {
            db,
            settlement,
            config,
        }
    }

    fn config(&self) -> Result<&VnpayConfig, ServiceError> {
        self.config.as_ref().ok_or_else(|| {
            ServiceError::ServiceUnavailable("VNPay is not configured".to_string())
        })
    }

    #[instrument(skip(self))]
    pub async fn create_payment_url(
        &self,
        user_id: Uuid,
        order_id: Uuid,
        ip_addr: &str,
    ) -> Result<PaymentUrlResponse, ServiceError> {
        let config = self.config()?;
        let order = payable_order(&*self.db, user_id, order_id).await?;
        if !order.currency.eq_ignore_ascii_case(CURRENCY) {
            return Err(ServiceError::ValidationError(format!(
                "VNPay only accepts {} orders, order is in {}",
                CURRENCY, order.currency
            )));
        }

        let created_at = Utc::now();
        let reference = txn_ref(order.id, created_at);
        let payment_url = build_payment_url(
            config,
            &PaymentUrlRequest {
                order_id: order.id,
                amount: order.total,
                order_info: format!("Payment for order {}", order.order_number),
                ip_addr: ip_addr.to_string(),
                created_at,
            },
        )?;

        record_payment_attempt(
            &*self.db,
            order.id,
            PaymentMethod::Vnpay,
            Some(reference.clone()),
        )
        .await?;

        info!(order_id = %order.id, txn_ref = %reference, "VNPay payment url issued");
        Ok(PaymentUrlResponse {
            order_id: order.id,
            order_number: order.order_number,
            txn_ref: reference,
            payment_url,
            expires_at: created_at + Duration::minutes(config.expire_minutes),
        })
    }

    /// Signature check and field extraction. Nothing is read from the callback
    /// before the signature passes.
    pub fn verify_callback(
        &self,
        params: &BTreeMap<String, String>,
    ) -> Result<VerifiedCallback, ServiceError> {
        let config = self.config()?;
        if !verify_params(&config.hash_secret, params) {
            warn!("VNPay callback signature mismatch");
            return Err(ServiceError::SignatureVerification(
                "invalid VNPay signature".to_string(),
            ));
        }

        let field = |name: &str| {
            params.get(name).cloned().ok_or_else(|| {
                ServiceError::ValidationError(format!("missing {} parameter", name))
            })
        };
        let txn_ref = field("vnp_TxnRef")?;
        let order_id = order_id_from_txn_ref(&txn_ref)?;
        let amount = field("vnp_Amount")?
            .parse::<i64>()
            .map_err(|_| ServiceError::ValidationError("malformed vnp_Amount".to_string()))?;

        Ok(VerifiedCallback {
            order_id,
            txn_ref,
            amount,
            response_code: field("vnp_ResponseCode")?,
            transaction_status: params.get("vnp_TransactionStatus").cloned(),
            transaction_no: params.get("vnp_TransactionNo").cloned(),
        })
    }

    fn check_amount(order: &order::Model, callback: &VerifiedCallback) -> Result<(), ServiceError> {
        if gateway_amount(order.total)? != callback.amount {
            return Err(ServiceError::ValidationError(format!(
                "amount {} does not match order {}",
                callback.amount, order.order_number
            )));
        }
        Ok(())
    }

    async fn settle(
        &self,
        callback: &VerifiedCallback,
    ) -> Result<SettlementOutcome, ServiceError> {
        if callback.is_success() {
            let transaction_id = callback
                .transaction_no
                .clone()
                .unwrap_or_else(|| callback.txn_ref.clone());
            self.settlement
                .mark_order_paid(callback.order_id, &transaction_id)
                .await
        } else {
            self.settlement
                .mark_order_payment_failed(
                    callback.order_id,
                    response_message(&callback.response_code),
                )
                .await
        }
    }

    /// Browser return. A bad signature is an error; a declined payment is a result.
    #[instrument(skip(self, params))]
    pub async fn process_return(
        &self,
        params: &BTreeMap<String, String>,
    ) -> Result<ReturnResult, ServiceError> {
        let callback = self.verify_callback(params)?;
        let order = find_order(&*self.db, callback.order_id).await?;
        Self::check_amount(&order, &callback)?;

        let outcome = self.settle(&callback).await?;
        let order = outcome.order();
        Ok(ReturnResult {
            order_id: order.id,
            order_number: order.order_number.clone(),
            success: callback.is_success(),
            response_code: callback.response_code.clone(),
            message: response_message(&callback.response_code).to_string(),
            payment_status: order.payment_status,
        })
    }

    /// Server-to-server notification. Always answers in the gateway's code set.
    #[instrument(skip(self, params))]
    pub async fn process_ipn(&self, params: &BTreeMap<String, String>) -> IpnResponse {
        let callback = match self.verify_callback(params) {
            Ok(callback) => callback,
            Err(ServiceError::SignatureVerification(_)) => return IpnResponse::INVALID_SIGNATURE,
            Err(ServiceError::ValidationError(_)) => return IpnResponse::ORDER_NOT_FOUND,
            Err(err) => {
                error!(error = %err, "VNPay IPN could not be verified");
                return IpnResponse::UNKNOWN_ERROR;
            }
        };

        let order = match find_order(&*self.db, callback.order_id).await {
            Ok(order) => order,
            Err(ServiceError::NotFound(_)) => return IpnResponse::ORDER_NOT_FOUND,
            Err(err) => {
                error!(error = %err, "VNPay IPN order lookup failed");
                return IpnResponse::UNKNOWN_ERROR;
            }
        };
        if Self::check_amount(&order, &callback).is_err() {
            warn!(order_id = %order.id, amount = callback.amount, "VNPay IPN amount mismatch");
            return IpnResponse::INVALID_AMOUNT;
        }

        match self.settle(&callback).await {
            Ok(outcome) if outcome.is_applied() => IpnResponse::CONFIRMED,
            Ok(_) => IpnResponse::ALREADY_CONFIRMED,
            Err(err) => {
                error!(error = %err, order_id = %order.id, "VNPay IPN settlement failed");
                IpnResponse::UNKNOWN_ERROR
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    const SECRET: &str = "VNPAYTESTSECRETKEY0123456789ABCD";

    fn config() -> VnpayConfig {
        VnpayConfig {
            tmn_code: "TESTTMN1".into(),
            hash_secret: SECRET.into(),
            payment_url: "https://sandbox.vnpayment.vn/paymentv2/vpcpay.html".into(),
            return_url: "https://shop.example/payment/return".into(),
            expire_minutes: 15,
        }
    }

    /// Parameters as the gateway would send them back.
    fn returned_params() -> BTreeMap<String, String> {
        let mut params = BTreeMap::new();
        params.insert("vnp_Amount".to_string(), "15000000".to_string());
        params.insert("vnp_BankCode".to_string(), "NCB".to_string());
        params.insert("vnp_OrderInfo".to_string(), "Payment for order ORD-20250101-0001".to_string());
        params.insert("vnp_ResponseCode".to_string(), "00".to_string());
        params.insert("vnp_TmnCode".to_string(), "TESTTMN1".to_string());
        params.insert("vnp_TransactionNo".to_string(), "14226112".to_string());
        params.insert("vnp_TransactionStatus".to_string(), "00".to_string());
        params.insert("vnp_TxnRef".to_string(), format!("{}-1735700400000", Uuid::nil().simple()));
        let signature = sign(SECRET, &canonical_query(&params));
        params.insert(SECURE_HASH.to_string(), signature);
        params.insert(SECURE_HASH_TYPE.to_string(), "HmacSHA512".to_string());
        params
    }

    #[test]
    fn canonical_query_sorts_and_encodes() {
        let mut params = BTreeMap::new();
        params.insert("vnp_OrderInfo".to_string(), "Thanh toan don/hang #1".to_string());
        params.insert("vnp_Amount".to_string(), "100".to_string());

        assert_eq!(
            canonical_query(&params),
            "vnp_Amount=100&vnp_OrderInfo=Thanh+toan+don%2Fhang+%231"
        );
    }

    #[test]
    fn payment_url_is_signed_over_its_own_query() {
        let created_at = Utc.with_ymd_and_hms(2025, 1, 1, 3, 0, 0).unwrap();
        let url = build_payment_url(
            &config(),
            &PaymentUrlRequest {
                order_id: Uuid::nil(),
                amount: dec!(150000),
                order_info: "Payment for order ORD-20250101-0001".into(),
                ip_addr: "127.0.0.1".into(),
                created_at,
            },
        )
        .unwrap();

        let (_, query) = url.split_once('?').unwrap();
        let params: BTreeMap<String, String> = url::form_urlencoded::parse(query.as_bytes())
            .into_owned()
            .collect();

        assert!(verify_params(SECRET, &params));
        assert_eq!(params["vnp_Amount"], "15000000");
        assert_eq!(
            params["vnp_TxnRef"],
            format!("{}-{}", Uuid::nil().simple(), created_at.timestamp_millis())
        );
        assert_eq!(params["vnp_CreateDate"], "20250101100000");
        assert_eq!(params["vnp_ExpireDate"], "20250101101500");
        assert_eq!(params["vnp_CurrCode"], "VND");
    }

    #[test]
    fn accepts_uppercase_signature() {
        let mut params = returned_params();
        let upper = params[SECURE_HASH].to_uppercase();
        params.insert(SECURE_HASH.to_string(), upper);
        assert!(verify_params(SECRET, &params));
    }

    #[test]
    fn rejects_missing_or_foreign_signature() {
        let mut params = returned_params();
        assert!(!verify_params("another-secret", &params));
        params.remove(SECURE_HASH);
        assert!(!verify_params(SECRET, &params));
    }

    #[test]
    fn each_attempt_gets_its_own_reference() {
        let order_id = Uuid::new_v4();
        let first = Utc.with_ymd_and_hms(2025, 1, 1, 3, 0, 0).unwrap();
        let retry = first + Duration::minutes(2);

        let a = txn_ref(order_id, first);
        let b = txn_ref(order_id, retry);
        assert_ne!(a, b);
        assert!(a.len() <= 100);
        assert_eq!(order_id_from_txn_ref(&a).unwrap(), order_id);
        assert_eq!(order_id_from_txn_ref(&b).unwrap(), order_id);
        assert_eq!(
            order_id_from_txn_ref(&order_id.simple().to_string()).unwrap(),
            order_id
        );
    }

    #[test]
    fn malformed_references_are_rejected() {
        for raw in ["", "-123", "not-a-uuid", &Uuid::nil().hyphenated().to_string()] {
            assert!(order_id_from_txn_ref(raw).is_err(), "{:?}", raw);
        }
    }

    #[test]
    fn unknown_codes_fall_back() {
        assert_eq!(response_message("00"), "Transaction successful");
        assert_eq!(response_message("24"), "Transaction cancelled by customer");
        assert_eq!(response_message("42"), "Unknown error");
    }

    #[test]
    fn success_needs_both_codes() {
        let callback = VerifiedCallback {
            order_id: Uuid::nil(),
            txn_ref: txn_ref(Uuid::nil(), Utc::now()),
            amount: 100,
            response_code: "00".into(),
            transaction_status: Some("02".into()),
            transaction_no: None,
        };
        assert!(!callback.is_success());
        assert!(VerifiedCallback {
            transaction_status: None,
            ..callback
        }
        .is_success());
    }

    fn flip(value: &str, index: usize) -> String {
        let mut chars: Vec<char> = value.chars().collect();
        let i = index % chars.len();
        chars[i] = if chars[i] == 'a' { 'b' } else { 'a' };
        chars.into_iter().collect()
    }

    proptest! {
        #[test]
        fn any_single_character_change_breaks_the_signature(
            field in prop::sample::select(vec![
                SECURE_HASH,
                "vnp_Amount",
                "vnp_OrderInfo",
                "vnp_ResponseCode",
                "vnp_TmnCode",
                "vnp_TransactionNo",
                "vnp_TxnRef",
            ]),
            index in 0usize..256,
        ) {
            let mut params = returned_params();
            let tampered = flip(&params[field], index);
            params.insert(field.to_string(), tampered);
            prop_assert!(!verify_params(SECRET, &params));
        }
    }
}
